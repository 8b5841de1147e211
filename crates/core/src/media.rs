use std::fmt;

use crate::graph::NodeRef;

/// What the current media reference carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    RawImage,
    Latent,
    /// Joint audio/video latent that must be separated before video-only work.
    LatentAudioVideo,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RawImage => "raw-image",
            Self::Latent => "latent",
            Self::LatentAudioVideo => "latent-audio-video",
        };
        f.write_str(name)
    }
}

/// The single live media handle of a build.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaCursor {
    pub reference: NodeRef,
    pub kind: MediaKind,
    pub fps: Option<u32>,
    /// Audio latent split off the video, kept for recombination or saving.
    pub audio_latent: Option<NodeRef>,
}

impl MediaCursor {
    pub fn new(reference: NodeRef, kind: MediaKind) -> Self {
        Self {
            reference,
            kind,
            fps: None,
            audio_latent: None,
        }
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = Some(fps);
        self
    }

    pub fn with_audio_latent(mut self, audio_latent: NodeRef) -> Self {
        self.audio_latent = Some(audio_latent);
        self
    }
}

/// One graph insertion step used to move media between kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// `VAEEncode`
    VaeEncode,
    /// `VAEDecode`
    VaeDecode,
    /// `LTXVSeparateAVLatent`, audio latent kept on the cursor.
    SeparateAudioVideo,
    /// `LTXVConcatAVLatent` with the held audio latent or a fresh empty one.
    AttachAudio,
}

/// Minimal node sequence converting `from` into `to`.
pub fn conversion_path(from: MediaKind, to: MediaKind) -> &'static [Conversion] {
    use Conversion::*;
    use MediaKind::*;

    match (from, to) {
        (RawImage, Latent) => &[VaeEncode],
        (RawImage, LatentAudioVideo) => &[VaeEncode, AttachAudio],
        (Latent, RawImage) => &[VaeDecode],
        (Latent, LatentAudioVideo) => &[AttachAudio],
        (LatentAudioVideo, Latent) => &[SeparateAudioVideo],
        (LatentAudioVideo, RawImage) => &[SeparateAudioVideo, VaeDecode],
        (RawImage, RawImage) | (Latent, Latent) | (LatentAudioVideo, LatentAudioVideo) => &[],
    }
}
