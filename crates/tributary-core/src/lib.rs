//! # Tributary Core
//!
//! Foundational types shared by the tributary stream operators.
//!
//! - **Values**: [`Value`], the runtime representation of a record field
//! - **Records**: [`Record`], a schema-less ordered field map, and
//!   [`Timestamped`], a keyed value with its logical timestamp
//!
//! ## Quick Start
//!
//! ```rust
//! use tributary_core::{Record, Value};
//!
//! let record = Record::new()
//!     .with_field("symbol", "BTC")
//!     .with_field("price", 45000.0);
//!
//! assert_eq!(record.get("price"), Some(&Value::Float(45000.0)));
//! assert_eq!(record.get_str("symbol"), Some("BTC"));
//! ```

pub mod record;
pub mod value;

pub use record::{Record, Timestamped};
pub use value::Value;
