pub mod abnormal;
pub mod session;

// Re-export common types
pub use abnormal::{AbnormalDetector, AbnormalError, UrlPatternDetector};
pub use session::{BrowserSession, SessionOptions};
