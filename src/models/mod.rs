mod photo;
mod session;

pub use photo::{DetectionRecord, PhotoRecord};
pub use session::CaptureSession;
