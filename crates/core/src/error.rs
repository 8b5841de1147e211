use thiserror::Error;

/// Errors caused by a parameter combination the caller asked for but the
/// active model family cannot honour.
///
/// These travel inside `anyhow::Error`; request boundaries can recover the
/// typed value with `err.downcast_ref::<UserConfigError>()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UserConfigError {
    #[error("cannot latent-upscale for model class '{compat_class}': no latent upscale node chain is registered for it")]
    UnsupportedLatentUpscale { compat_class: String },

    #[error("the prompt has an '<extend:' block, but no video extend model is selected")]
    MissingExtendModel,

    #[error("unknown model '{name}' given for parameter '{param}'")]
    UnknownModel { param: String, name: String },

    #[error("invalid frame count '{value}' in '<extend:' block")]
    InvalidExtendFrames { value: String },
}

/// Returns the user-facing configuration error wrapped in `err`, if any.
pub fn as_user_config_error(err: &anyhow::Error) -> Option<&UserConfigError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<UserConfigError>())
}
