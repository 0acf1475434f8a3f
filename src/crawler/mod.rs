pub mod browser;
pub mod engine;
pub mod traits;

pub use browser::ChromeDriver;
pub use engine::{collect_listings, CollectError, CollectorSettings, RecordFilter};
pub use traits::{ListDriver, Session};
