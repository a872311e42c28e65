pub use tokio_test::{assert_err, assert_ok};
