//! Token stream interpreter

use super::error::{NotationError, NotationResult};
use super::numstr::index_key;
use super::token::{Live, Opt, Token, TypeSpec};
use crate::CodecConfig;
use crate::bson::{Bson, Oid, Value};
use std::borrow::Cow;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Expecting a key or the end of the current document.
    Element,
    DocSpecValue,
    DocValue,
    /// Expecting an array element, a marker, or the end of the array.
    ArraySpecValue,
    ArrayValue,
}

pub fn build(tokens: &[Token<'_>]) -> NotationResult<Bson> {
    build_with(CodecConfig::default(), tokens)
}

pub fn build_with(config: CodecConfig, tokens: &[Token<'_>]) -> NotationResult<Bson> {
    let mut b = Bson::with_config(config);
    build_into(&mut b, tokens)?;
    b.finish()?;
    Ok(b)
}

/// Replays `tokens` into a document that is still being built. The
/// document is left open so callers can keep appending.
pub fn build_into(b: &mut Bson, tokens: &[Token<'_>]) -> NotationResult<()> {
    trace!("replaying {} notation tokens", tokens.len());
    Machine {
        b,
        tokens,
        pos: 0,
        state: State::Element,
        returns: Vec::new(),
        indices: Vec::new(),
        index: 0,
    }
    .run()
}

struct Machine<'b, 't, 'a> {
    b: &'b mut Bson,
    tokens: &'t [Token<'a>],
    pos: usize,
    state: State,
    returns: Vec<State>,
    indices: Vec<usize>,
    index: usize,
}

impl<'a> Machine<'_, '_, 'a> {
    fn next_token(&mut self) -> Token<'a> {
        let token = self.tokens.get(self.pos).copied().unwrap_or(Token::End);
        self.pos += 1;
        token
    }

    fn push(&mut self, ret: State) {
        self.returns.push(ret);
        self.indices.push(self.index);
        self.index = 0;
    }

    fn pop(&mut self) {
        self.state = self.returns.pop().unwrap_or(State::Element);
        self.index = self.indices.pop().unwrap_or(0);
    }

    fn element_key(&mut self, in_array: bool, key: &Cow<'a, str>) -> Cow<'a, str> {
        if in_array {
            let k = index_key(self.index);
            self.index += 1;
            k
        } else {
            key.clone()
        }
    }

    fn after_value(in_array: bool) -> State {
        if in_array {
            State::ArraySpecValue
        } else {
            State::Element
        }
    }

    fn run(mut self) -> NotationResult<()> {
        let mut key: Cow<'a, str> = Cow::Borrowed("");
        let mut spec: Option<TypeSpec> = None;

        loop {
            let position = self.pos;
            let token = self.next_token();

            match self.state {
                State::Element => match token {
                    Token::End => break,
                    Token::Text(k) => {
                        key = Cow::Borrowed(k);
                        self.state = State::DocSpecValue;
                    }
                    Token::CloseDoc => {
                        if self.returns.is_empty() {
                            return Err(NotationError::Unbalanced(position));
                        }
                        self.b.finish_object()?;
                        self.pop();
                    }
                    Token::CloseArray => return Err(NotationError::Unbalanced(position)),
                    _ => {
                        return Err(NotationError::UnexpectedToken {
                            position,
                            expected: "a key",
                        });
                    }
                },

                State::DocSpecValue | State::ArraySpecValue => {
                    let in_array = self.state == State::ArraySpecValue;
                    match token {
                        Token::End => break,
                        Token::CloseArray if in_array => {
                            self.b.finish_array()?;
                            self.pop();
                        }
                        Token::CloseDoc | Token::CloseArray => {
                            return Err(NotationError::Unbalanced(position));
                        }
                        Token::Spec(TypeSpec::Null) => {
                            let k = self.element_key(in_array, &key);
                            self.b.append_null(k.as_bytes())?;
                            self.state = Self::after_value(in_array);
                        }
                        Token::Spec(s) => {
                            spec = Some(s);
                            self.state = if in_array {
                                State::ArrayValue
                            } else {
                                State::DocValue
                            };
                        }
                        _ => {
                            // no marker; read the same token as the value
                            self.pos = position;
                            self.state = if in_array {
                                State::ArrayValue
                            } else {
                                State::DocValue
                            };
                        }
                    }
                }

                State::DocValue | State::ArrayValue => {
                    if matches!(token, Token::End) {
                        break;
                    }
                    let in_array = self.state == State::ArrayValue;
                    let ret = Self::after_value(in_array);

                    match (spec, token) {
                        (None, Token::OpenDoc) => {
                            let k = self.element_key(in_array, &key);
                            self.b.begin_object(k.as_bytes())?;
                            self.push(ret);
                            self.state = State::Element;
                        }
                        (None, Token::OpenArray) => {
                            let k = self.element_key(in_array, &key);
                            self.b.begin_array(k.as_bytes())?;
                            self.push(ret);
                            self.state = State::ArraySpecValue;
                        }
                        (
                            Some(s),
                            Token::OpenDoc
                            | Token::OpenArray
                            | Token::CloseDoc
                            | Token::CloseArray
                            | Token::Spec(_),
                        ) => {
                            return Err(NotationError::TypeSpec { spec: s, position });
                        }
                        (None, Token::CloseDoc | Token::CloseArray | Token::Spec(_)) => {
                            return Err(NotationError::UnexpectedToken {
                                position,
                                expected: "a value",
                            });
                        }
                        (_, value) => {
                            let k = self.element_key(in_array, &key);
                            self.append(k.as_bytes(), spec.take(), value, position)?;
                            self.state = ret;
                        }
                    }
                }
            }
        }

        if self.state == State::Element && self.returns.is_empty() {
            Ok(())
        } else {
            Err(NotationError::DocumentIncomplete {
                state: self.state,
                depth: self.returns.len(),
            })
        }
    }

    fn append(
        &mut self,
        key: &[u8],
        spec: Option<TypeSpec>,
        token: Token<'a>,
        position: usize,
    ) -> NotationResult<()> {
        match (spec, token) {
            (None | Some(TypeSpec::String), Token::Text(s)) => self.b.append_string(key, s)?,
            (Some(TypeSpec::Symbol), Token::Text(s)) => self.b.append_symbol(key, s)?,
            (Some(TypeSpec::Code), Token::Text(s)) => self.b.append_code(key, s)?,
            (Some(TypeSpec::Oid), Token::Text(hex)) => {
                let oid = Oid::from_hex(hex)?;
                self.b.append_oid(key, &oid)?;
            }
            (Some(TypeSpec::Oid), Token::Value(Value::Oid(oid))) => self.b.append_oid(key, &oid)?,
            (Some(TypeSpec::Regex), Token::Text(pattern)) => {
                let options_at = self.pos;
                match self.next_token() {
                    Token::Text(options) => self.b.append_regex(key, pattern, options)?,
                    _ => {
                        return Err(NotationError::TypeSpec {
                            spec: TypeSpec::Regex,
                            position: options_at,
                        });
                    }
                }
            }
            (None, Token::Value(v)) => self.b.append_value(key, &v)?,
            (Some(TypeSpec::String), Token::Live(live @ Live::String(_))) | (None, Token::Live(live)) => {
                self.append_live(key, live, position)?
            }
            (Some(TypeSpec::String), Token::Opt(opt @ Opt::String(_))) | (None, Token::Opt(opt)) => {
                self.append_opt(key, opt, position)?
            }
            (Some(s), _) => return Err(NotationError::TypeSpec { spec: s, position }),
            (None, _) => {
                return Err(NotationError::UnexpectedToken {
                    position,
                    expected: "a value",
                });
            }
        }
        Ok(())
    }

    fn append_live(&mut self, key: &[u8], live: Live<'_>, position: usize) -> NotationResult<()> {
        match live {
            Live::Double(c) => self.b.append_double(key, c.get())?,
            Live::Int(c) => self.b.append_int(key, c.get())?,
            Live::Long(c) => self.b.append_long(key, c.get())?,
            Live::Bool(c) => self.b.append_bool(key, c.get())?,
            Live::Date(c) => self.b.append_date(key, c.get())?,
            Live::Oid(c) => self.b.append_oid(key, &c.get())?,
            Live::String(c) => {
                let s = c.try_borrow().map_err(|_| NotationError::Borrowed(position))?;
                self.b.append_string(key, &s)?;
            }
        }
        Ok(())
    }

    fn append_opt(&mut self, key: &[u8], opt: Opt<'_>, position: usize) -> NotationResult<()> {
        match opt {
            Opt::Double(c) => match c.get() {
                Some(v) => self.b.append_double(key, v)?,
                None => self.b.append_null(key)?,
            },
            Opt::Int(c) => match c.get() {
                Some(v) => self.b.append_int(key, v)?,
                None => self.b.append_null(key)?,
            },
            Opt::Long(c) => match c.get() {
                Some(v) => self.b.append_long(key, v)?,
                None => self.b.append_null(key)?,
            },
            Opt::Bool(c) => match c.get() {
                Some(v) => self.b.append_bool(key, v)?,
                None => self.b.append_null(key)?,
            },
            Opt::Date(c) => match c.get() {
                Some(v) => self.b.append_date(key, v)?,
                None => self.b.append_null(key)?,
            },
            Opt::Oid(c) => match c.get() {
                Some(v) => self.b.append_oid(key, &v)?,
                None => self.b.append_null(key)?,
            },
            Opt::String(c) => {
                let s = c.try_borrow().map_err(|_| NotationError::Borrowed(position))?;
                match s.as_deref() {
                    Some(v) => self.b.append_string(key, v)?,
                    None => self.b.append_null(key)?,
                }
            }
        }
        Ok(())
    }
}
