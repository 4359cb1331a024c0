use crate::bson::{Oid, Timestamp, Value};
use std::cell::{Cell, RefCell};

/// Type markers. A marker applies to the value token that follows it,
/// except `Null`, which stands for the value itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeSpec {
    String,
    Symbol,
    Code,
    /// Next text token is a 24-digit hex object id.
    Oid,
    Null,
    /// Next two text tokens are the pattern and the options.
    Regex,
}

/// Values read through a shared reference when the stream is replayed,
/// so one template can build many documents.
#[derive(Debug, Clone, Copy)]
pub enum Live<'a> {
    Double(&'a Cell<f64>),
    Int(&'a Cell<i32>),
    Long(&'a Cell<i64>),
    Bool(&'a Cell<bool>),
    /// Milliseconds since the epoch.
    Date(&'a Cell<i64>),
    Oid(&'a Cell<Oid>),
    String(&'a RefCell<String>),
}

/// Like [`Live`], but `None` at replay time appends a null.
#[derive(Debug, Clone, Copy)]
pub enum Opt<'a> {
    Double(&'a Cell<Option<f64>>),
    Int(&'a Cell<Option<i32>>),
    Long(&'a Cell<Option<i64>>),
    Bool(&'a Cell<Option<bool>>),
    Date(&'a Cell<Option<i64>>),
    Oid(&'a Cell<Option<Oid>>),
    String(&'a RefCell<Option<String>>),
}

#[derive(Debug, Clone, Copy)]
pub enum Token<'a> {
    /// A key, or an untyped string value.
    Text(&'a str),
    Value(Value<'a>),
    Live(Live<'a>),
    Opt(Opt<'a>),
    Spec(TypeSpec),
    OpenDoc,
    CloseDoc,
    OpenArray,
    CloseArray,
    /// Ends the stream before the end of the slice.
    End,
}

impl<'a> From<&'a str> for Token<'a> {
    fn from(s: &'a str) -> Self {
        Token::Text(s)
    }
}

impl<'a> From<Value<'a>> for Token<'a> {
    fn from(v: Value<'a>) -> Self {
        Token::Value(v)
    }
}

impl From<TypeSpec> for Token<'_> {
    fn from(spec: TypeSpec) -> Self {
        Token::Spec(spec)
    }
}

macro_rules! value_tokens {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Token<'_> {
                fn from(v: $ty) -> Self {
                    Token::Value(Value::from(v))
                }
            }
        )*
    };
}

value_tokens!(f64, i32, i64, bool, Oid, Timestamp);

macro_rules! cell_tokens {
    ($family:ident, $($cell:ty => $variant:ident),*) => {
        $(
            impl<'a> From<&'a $cell> for Token<'a> {
                fn from(cell: &'a $cell) -> Self {
                    Token::$family($family::$variant(cell))
                }
            }
        )*
    };
}

cell_tokens!(Live,
    Cell<f64> => Double,
    Cell<i32> => Int,
    Cell<i64> => Long,
    Cell<bool> => Bool,
    Cell<Oid> => Oid,
    RefCell<String> => String
);

cell_tokens!(Opt,
    Cell<Option<f64>> => Double,
    Cell<Option<i32>> => Int,
    Cell<Option<i64>> => Long,
    Cell<Option<bool>> => Bool,
    Cell<Option<Oid>> => Oid,
    RefCell<Option<String>> => String
);
