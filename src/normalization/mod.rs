pub mod play;

pub use play::{normalize, normalize_all, NormalizeFailure, NormalizeReport, NormalizedPlay, RawPlay};
