/*!
# hostwatch DevKit - test tooling for the escalation pipeline

- Recording notification dispatcher (no gateway needed)
- Store fixtures in temp dirs, legacy document builders
- Harness replaying monitoring runs on a scripted clock
*/

pub mod dispatch_stub;
pub mod store_fixtures;
pub mod test_utils;

pub use dispatch_stub::{AlarmChannel, MockDispatcher, SentAlarm};
pub use store_fixtures::{LegacyEntry, StoreFixture};
pub use test_utils::TestHarness;
