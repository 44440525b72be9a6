//! External command builders for the encoder and the fetcher.

pub mod ffmpeg;
pub mod ytdlp;

pub use ffmpeg::{AudioCodec, TwoPassParams};
pub use ytdlp::{format_selector, needs_recode, FetchParams};
