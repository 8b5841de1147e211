use anyhow::Result;

use crate::error::UserConfigError;
use crate::params::sections;

pub const EXTEND_TAG: &str = "<extend:";

/// One `<extend:N>` block of a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendSegment {
    pub index: usize,
    pub frames: u32,
    pub prompt: String,
    /// Parameter section holding per-segment overrides (`extend0`, ...).
    pub section: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedPrompt {
    pub base: String,
    pub segments: Vec<ExtendSegment>,
}

pub fn has_extend(prompt: &str) -> bool {
    prompt.contains(EXTEND_TAG)
}

/// Splits a prompt into its base text and `<extend:N>` segments.
///
/// Text before the first tag is the base prompt; each tag's text runs until
/// the next tag.
pub fn parse_prompt(prompt: &str) -> Result<ParsedPrompt> {
    let Some(first) = prompt.find(EXTEND_TAG) else {
        return Ok(ParsedPrompt {
            base: prompt.trim().to_string(),
            segments: Vec::new(),
        });
    };

    let base = prompt[..first].trim().to_string();
    let mut segments = Vec::new();
    let mut rest = &prompt[first..];

    while let Some(tag) = rest.strip_prefix(EXTEND_TAG) {
        let Some(close) = tag.find('>') else {
            return Err(UserConfigError::InvalidExtendFrames {
                value: tag.trim().to_string(),
            }
            .into());
        };
        let data = tag[..close].trim();
        let frames: u32 = data
            .parse()
            .map_err(|_| UserConfigError::InvalidExtendFrames {
                value: data.to_string(),
            })?;

        let body = &tag[close + 1..];
        let end = body.find(EXTEND_TAG).unwrap_or(body.len());
        let index = segments.len();
        segments.push(ExtendSegment {
            index,
            frames,
            prompt: body[..end].trim().to_string(),
            section: sections::extend(index),
        });
        rest = &body[end..];
    }

    Ok(ParsedPrompt { base, segments })
}
