//! Generic vertex ingestion, mirroring the `DecodePosition` pattern the
//! teacher crate uses to stay agnostic of the caller's own vertex layout.

/// Implemented by any type a caller wants to feed into [`crate::cache`]
/// directly, without first copying into a dedicated position buffer.
pub trait DecodePosition {
    fn decode_position(&self) -> [f64; 3];
}

impl DecodePosition for [f64; 3] {
    fn decode_position(&self) -> [f64; 3] {
        *self
    }
}

impl DecodePosition for [f32; 3] {
    fn decode_position(&self) -> [f64; 3] {
        [f64::from(self[0]), f64::from(self[1]), f64::from(self[2])]
    }
}

impl DecodePosition for (f64, f64, f64) {
    fn decode_position(&self) -> [f64; 3] {
        [self.0, self.1, self.2]
    }
}
