mod fake_data_source;

pub use fake_data_source::{FakeAttemptOutcome, FakeDataSourceFactory, FakeDataSourceStats};
