use vidgraph_core::as_user_config_error;

fn main() {
    if let Err(error) = vidgraph_app::run_from_env() {
        match as_user_config_error(&error) {
            Some(user_error) => tracing::error!("Invalid request: {user_error}"),
            None => tracing::error!("{error:#}"),
        }
        std::process::exit(1);
    }
}
