//! Contract value codec.
//!
//! Calls and results are described by [`ParamType`] schemas and carried as
//! [`Token`]s. Only the shapes the registry interface uses are supported:
//! `uint256` (values must fit in 128 bits), `address`, `bool`, `string`,
//! `bytes32`, dynamic arrays and tuples.

use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::error::DashboardError;
use crate::models::Address;

const WORD: usize = 32;

/// Selector of the standard `Error(string)` revert payload.
pub const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
/// Selector of the standard `Panic(uint256)` revert payload.
pub const PANIC_SELECTOR: [u8; 4] = [0x4e, 0x48, 0x7b, 0x71];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AbiError {
    #[error("data too short: needed {needed} bytes at offset {offset}")]
    OutOfBounds { offset: usize, needed: usize },
    #[error("integer does not fit in 128 bits")]
    Overflow,
    #[error("invalid boolean word")]
    InvalidBool,
    #[error("string is not valid utf-8")]
    InvalidUtf8,
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("expected {expected}, found {found}")]
    UnexpectedToken { expected: &'static str, found: String },
}

impl From<AbiError> for DashboardError {
    fn from(err: AbiError) -> Self {
        DashboardError::Decode(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    Uint,
    Address,
    Bool,
    String,
    Bytes32,
    Array(Box<ParamType>),
    Tuple(Vec<ParamType>),
}

impl ParamType {
    pub fn is_dynamic(&self) -> bool {
        match self {
            ParamType::String | ParamType::Array(_) => true,
            ParamType::Tuple(items) => items.iter().any(ParamType::is_dynamic),
            _ => false,
        }
    }

    /// Bytes this type occupies in the head section of an enclosing tuple.
    fn head_len(&self) -> usize {
        match self {
            ParamType::Tuple(items) if !self.is_dynamic() => {
                items.iter().map(ParamType::head_len).sum()
            }
            _ => WORD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Uint(u128),
    Address(Address),
    Bool(bool),
    String(String),
    Bytes32([u8; 32]),
    Array(Vec<Token>),
    Tuple(Vec<Token>),
}

impl Token {
    fn is_dynamic(&self) -> bool {
        match self {
            Token::String(_) | Token::Array(_) => true,
            Token::Tuple(items) => items.iter().any(Token::is_dynamic),
            _ => false,
        }
    }

    fn head_len(&self) -> usize {
        match self {
            Token::Tuple(items) if !self.is_dynamic() => items.iter().map(Token::head_len).sum(),
            _ => WORD,
        }
    }

    fn unexpected(&self, expected: &'static str) -> AbiError {
        AbiError::UnexpectedToken {
            expected,
            found: format!("{:?}", self),
        }
    }

    pub fn into_uint(self) -> Result<u128, AbiError> {
        match self {
            Token::Uint(v) => Ok(v),
            other => Err(other.unexpected("uint")),
        }
    }

    pub fn into_u64(self) -> Result<u64, AbiError> {
        u64::try_from(self.into_uint()?).map_err(|_| AbiError::Overflow)
    }

    pub fn into_address(self) -> Result<Address, AbiError> {
        match self {
            Token::Address(a) => Ok(a),
            other => Err(other.unexpected("address")),
        }
    }

    pub fn into_bool(self) -> Result<bool, AbiError> {
        match self {
            Token::Bool(b) => Ok(b),
            other => Err(other.unexpected("bool")),
        }
    }

    pub fn into_string(self) -> Result<String, AbiError> {
        match self {
            Token::String(s) => Ok(s),
            other => Err(other.unexpected("string")),
        }
    }

    pub fn into_bytes32(self) -> Result<[u8; 32], AbiError> {
        match self {
            Token::Bytes32(b) => Ok(b),
            other => Err(other.unexpected("bytes32")),
        }
    }

    pub fn into_array(self) -> Result<Vec<Token>, AbiError> {
        match self {
            Token::Array(items) => Ok(items),
            other => Err(other.unexpected("array")),
        }
    }

    pub fn into_tuple(self) -> Result<Vec<Token>, AbiError> {
        match self {
            Token::Tuple(items) => Ok(items),
            other => Err(other.unexpected("tuple")),
        }
    }
}

pub fn keccak256(input: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(input);
    let result = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

/// 4-byte function selector for a canonical signature such as `getProperty(uint256)`.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Selector followed by the encoded arguments.
pub fn call_data(signature: &str, args: &[Token]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    data.extend_from_slice(&encode(args));
    data
}

pub fn encode(tokens: &[Token]) -> Vec<u8> {
    let head_len: usize = tokens.iter().map(Token::head_len).sum();
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();
    for token in tokens {
        if token.is_dynamic() {
            head.extend_from_slice(&uint_word((head_len + tail.len()) as u128));
            tail.extend_from_slice(&encode_token(token));
        } else {
            head.extend_from_slice(&encode_token(token));
        }
    }
    head.extend_from_slice(&tail);
    head
}

fn encode_token(token: &Token) -> Vec<u8> {
    match token {
        Token::Uint(v) => uint_word(*v).to_vec(),
        Token::Address(a) => {
            let mut word = [0u8; WORD];
            word[12..].copy_from_slice(a.as_bytes());
            word.to_vec()
        }
        Token::Bool(b) => uint_word(u128::from(*b)).to_vec(),
        Token::Bytes32(b) => b.to_vec(),
        Token::String(s) => {
            let bytes = s.as_bytes();
            let mut out = uint_word(bytes.len() as u128).to_vec();
            out.extend_from_slice(bytes);
            out.resize(WORD + padded_len(bytes.len()), 0);
            out
        }
        Token::Array(items) => {
            let mut out = uint_word(items.len() as u128).to_vec();
            out.extend_from_slice(&encode(items));
            out
        }
        Token::Tuple(items) => encode(items),
    }
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(WORD) * WORD
}

fn uint_word(value: u128) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

pub fn decode(types: &[ParamType], data: &[u8]) -> Result<Vec<Token>, AbiError> {
    decode_params(types, data, 0)
}

/// Decodes a single return value.
pub fn decode_one(ty: ParamType, data: &[u8]) -> Result<Token, AbiError> {
    let mut tokens = decode(std::slice::from_ref(&ty), data)?;
    tokens.pop().ok_or(AbiError::OutOfBounds {
        offset: 0,
        needed: WORD,
    })
}

fn decode_params(types: &[ParamType], data: &[u8], base: usize) -> Result<Vec<Token>, AbiError> {
    let mut offset = base;
    let mut out = Vec::with_capacity(types.len());
    for ty in types {
        if ty.is_dynamic() {
            let relative = read_usize(data, offset)?;
            let at = base.checked_add(relative).ok_or(AbiError::Overflow)?;
            out.push(decode_value(ty, data, at)?);
            offset += WORD;
        } else {
            out.push(decode_value(ty, data, offset)?);
            offset += ty.head_len();
        }
    }
    Ok(out)
}

fn decode_value(ty: &ParamType, data: &[u8], at: usize) -> Result<Token, AbiError> {
    match ty {
        ParamType::Uint => read_u128(data, at).map(Token::Uint),
        ParamType::Address => {
            let word = read_word(data, at)?;
            let mut bytes = [0u8; 20];
            bytes.copy_from_slice(&word[12..]);
            Ok(Token::Address(Address::from_bytes(bytes)))
        }
        ParamType::Bool => match read_u128(data, at)? {
            0 => Ok(Token::Bool(false)),
            1 => Ok(Token::Bool(true)),
            _ => Err(AbiError::InvalidBool),
        },
        ParamType::Bytes32 => Ok(Token::Bytes32(read_word(data, at)?)),
        ParamType::String => {
            let len = read_usize(data, at)?;
            let bytes = slice(data, at + WORD, len)?;
            String::from_utf8(bytes.to_vec())
                .map(Token::String)
                .map_err(|_| AbiError::InvalidUtf8)
        }
        ParamType::Array(inner) => {
            let len = read_usize(data, at)?;
            let start = at + WORD;
            // every element needs at least one head word
            slice(data, start, len.checked_mul(WORD).ok_or(AbiError::Overflow)?)?;
            let types = vec![(**inner).clone(); len];
            decode_params(&types, data, start).map(Token::Array)
        }
        ParamType::Tuple(items) => decode_params(items, data, at).map(Token::Tuple),
    }
}

fn slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], AbiError> {
    let end = offset.checked_add(len).ok_or(AbiError::Overflow)?;
    data.get(offset..end).ok_or(AbiError::OutOfBounds {
        offset,
        needed: len,
    })
}

fn read_word(data: &[u8], offset: usize) -> Result<[u8; WORD], AbiError> {
    let mut word = [0u8; WORD];
    word.copy_from_slice(slice(data, offset, WORD)?);
    Ok(word)
}

fn read_u128(data: &[u8], offset: usize) -> Result<u128, AbiError> {
    let word = read_word(data, offset)?;
    if word[..16].iter().any(|b| *b != 0) {
        return Err(AbiError::Overflow);
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(low))
}

fn read_usize(data: &[u8], offset: usize) -> Result<usize, AbiError> {
    usize::try_from(read_u128(data, offset)?).map_err(|_| AbiError::Overflow)
}

/// Extracts a human-readable reason from revert data, if it carries one.
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    let (sel, payload) = data.split_at_checked(4)?;
    if sel == ERROR_STRING_SELECTOR {
        decode_one(ParamType::String, payload)
            .and_then(Token::into_string)
            .ok()
    } else if sel == PANIC_SELECTOR {
        let code = decode_one(ParamType::Uint, payload).ok()?.into_uint().ok()?;
        Some(format!("panic code 0x{:02x}", code))
    } else {
        None
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

pub fn from_hex(text: &str) -> Result<Vec<u8>, AbiError> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    hex::decode(digits).map_err(|e| AbiError::InvalidHex(e.to_string()))
}

/// Parses a hex quantity such as `0x7a69`.
pub fn parse_quantity(text: &str) -> Result<u128, AbiError> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16).map_err(|e| AbiError::InvalidHex(e.to_string()))
}

pub fn quantity(value: u128) -> String {
    format!("0x{:x}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_known_selectors() {
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(selector("Error(string)"), ERROR_STRING_SELECTOR);
        assert_eq!(selector("Panic(uint256)"), PANIC_SELECTOR);
    }

    #[test]
    fn encodes_string_arguments_with_offsets() {
        let data = encode(&[Token::Uint(7), Token::String("abc".into())]);
        assert_eq!(data.len(), 4 * WORD);
        assert_eq!(read_u128(&data, 0).unwrap(), 7);
        assert_eq!(read_u128(&data, WORD).unwrap(), 64);
        assert_eq!(read_u128(&data, 2 * WORD).unwrap(), 3);
        assert_eq!(&data[3 * WORD..3 * WORD + 3], b"abc");
    }

    #[test]
    fn decodes_dynamic_tuple_and_array() {
        let owner: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        let tuple = Token::Tuple(vec![
            Token::Uint(1),
            Token::String("Karnataka".into()),
            Token::Address(owner),
            Token::Bool(true),
        ]);
        let data = encode(&[tuple.clone()]);
        let schema = ParamType::Tuple(vec![
            ParamType::Uint,
            ParamType::String,
            ParamType::Address,
            ParamType::Bool,
        ]);
        assert_eq!(decode_one(schema, &data).unwrap(), tuple);

        let ids = Token::Array(vec![Token::Uint(3), Token::Uint(9)]);
        let data = encode(&[ids.clone()]);
        assert_eq!(
            decode_one(ParamType::Array(Box::new(ParamType::Uint)), &data).unwrap(),
            ids
        );
    }

    #[test]
    fn rejects_truncated_data() {
        let data = encode(&[Token::String("hello".into())]);
        let err = decode_one(ParamType::String, &data[..40]).unwrap_err();
        assert!(matches!(err, AbiError::OutOfBounds { .. }));
    }

    #[test]
    fn rejects_arrays_longer_than_their_data() {
        let mut data = uint_word(32).to_vec();
        data.extend_from_slice(&uint_word(1_000_000));
        assert!(decode_one(ParamType::Array(Box::new(ParamType::Uint)), &data).is_err());
    }

    #[test]
    fn decodes_revert_reasons() {
        let data = call_data("Error(string)", &[Token::String("Not the owner".into())]);
        assert_eq!(decode_revert_reason(&data).as_deref(), Some("Not the owner"));

        let panic = call_data("Panic(uint256)", &[Token::Uint(0x11)]);
        assert_eq!(decode_revert_reason(&panic).as_deref(), Some("panic code 0x11"));

        assert_eq!(decode_revert_reason(&[0xde, 0xad]), None);
    }

    #[test]
    fn parses_hex_quantities() {
        assert_eq!(parse_quantity("0x7a69").unwrap(), 31337);
        assert_eq!(parse_quantity("0x").unwrap(), 0);
        assert_eq!(quantity(31337), "0x7a69");
        assert!(parse_quantity("0xzz").is_err());
    }
}
