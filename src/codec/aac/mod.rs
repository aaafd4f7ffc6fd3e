//! AAC audio parsing: ADTS headers and the MPEG-4 AudioSpecificConfig.

pub mod parser;
pub mod types;

pub use parser::{fill_adts_header, parse_adts_header};
pub use types::{AacCodecData, Mpeg4AudioConfig, ADTS_HEADER_LENGTH, SAMPLES_PER_FRAME};
