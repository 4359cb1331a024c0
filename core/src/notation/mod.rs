//! Builder notation
//!
//! Documents described as a flat token stream. Keys and values
//! alternate; `OpenDoc`/`CloseDoc` and `OpenArray`/`CloseArray` nest.
//! Array elements take no keys, their indices are generated.
//!
//! ```
//! use docwire_core::notation::{self, Token};
//!
//! let doc = notation::build(&[
//!     Token::from("name"), Token::from("widget"),
//!     Token::from("sizes"), Token::OpenArray, Token::from(1), Token::from(2), Token::CloseArray,
//! ])
//! .unwrap();
//! assert_eq!(doc.find("name").unwrap().as_str(), "widget");
//! ```

mod error;
mod machine;
mod numstr;
mod token;

pub use error::{NotationError, NotationResult};
pub use machine::{State, build, build_into, build_with};
pub use numstr::{INDEX_TABLE_LEN, index_key};
pub use token::{Live, Opt, Token, TypeSpec};
