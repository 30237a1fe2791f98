//! Schema-checked ABI encoding for the opaque transfer payloads.
//!
//! Transfer state and resolver values travel as structured JSON accompanied by an ABI-style type
//! string from the transfer registry, e.g. `tuple(bytes32 lockHash, uint256 expiry)`. Payloads
//! are validated against the declared encoding at the protocol boundary, before anything reaches
//! the predicate simulator, and the canonical ABI encoding is what gets hashed into a transfer's
//! `initial_state_hash`.

use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{keccak256, B256, I256, U256};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AbiError {
    #[error("cannot parse encoding '{encoding}': {reason}")]
    BadEncoding { encoding: String, reason: String },
    #[error("payload does not match encoding at '{field}': {reason}")]
    Mismatch { field: String, reason: String },
}

impl AbiError {
    fn mismatch(field: &str, reason: impl Into<String>) -> Self {
        AbiError::Mismatch { field: field.to_string(), reason: reason.into() }
    }
}

/// A parsed encoding string. Tuples keep their field names so JSON objects can be coerced by
/// name; unnamed fields fall back to positional coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    Primitive(DynSolType),
    Tuple(Vec<(String, Schema)>),
    Array(Box<Schema>),
    FixedArray(Box<Schema>, usize),
}

/// Parse an ABI-style type string such as `tuple(bytes32 lockHash, uint256 expiry)` or
/// `address[]`.
pub fn parse_encoding(encoding: &str) -> Result<Schema, AbiError> {
    let bad = |reason: &str| AbiError::BadEncoding { encoding: encoding.to_string(), reason: reason.to_string() };
    let (schema, rest) = parse_type(encoding.trim()).map_err(|r| bad(&r))?;
    if !rest.trim().is_empty() {
        return Err(bad(&format!("trailing input '{rest}'")));
    }
    Ok(schema)
}

fn parse_type(input: &str) -> Result<(Schema, &str), String> {
    let input = input.trim_start();
    let (base, rest) = if let Some(inner) = input.strip_prefix("tuple(") {
        let (fields, rest) = parse_tuple_fields(inner)?;
        (Schema::Tuple(fields), rest)
    } else {
        let end = input
            .find(|c: char| !(c.is_ascii_alphanumeric()))
            .unwrap_or(input.len());
        if end == 0 {
            return Err(format!("expected a type at '{input}'"));
        }
        let ty = DynSolType::parse(&input[..end]).map_err(|e| e.to_string())?;
        (Schema::Primitive(ty), &input[end..])
    };
    parse_array_suffix(base, rest)
}

fn parse_tuple_fields(mut input: &str) -> Result<(Vec<(String, Schema)>, &str), String> {
    let mut fields = Vec::new();
    loop {
        let trimmed = input.trim_start();
        if let Some(rest) = trimmed.strip_prefix(')') {
            return Ok((fields, rest));
        }
        let (schema, rest) = parse_type(trimmed)?;
        let rest = rest.trim_start();
        // Optional field name before ',' or ')'.
        let name_end = rest.find([',', ')']).ok_or_else(|| "unterminated tuple".to_string())?;
        let name = rest[..name_end].trim();
        let name = if name.is_empty() { fields.len().to_string() } else { name.to_string() };
        fields.push((name, schema));
        input = match rest.as_bytes()[name_end] {
            b',' => &rest[name_end + 1..],
            _ => &rest[name_end..], // leave ')' for the loop head
        };
    }
}

fn parse_array_suffix(base: Schema, input: &str) -> Result<(Schema, &str), String> {
    let mut schema = base;
    let mut rest = input;
    while let Some(after) = rest.trim_start().strip_prefix('[') {
        match after.find(']') {
            Some(0) => {
                schema = Schema::Array(Box::new(schema));
                rest = &after[1..];
            }
            Some(end) => {
                let len: usize = after[..end].trim().parse().map_err(|_| format!("bad array length '{after}'"))?;
                schema = Schema::FixedArray(Box::new(schema), len);
                rest = &after[end + 1..];
            }
            None => return Err("unterminated array suffix".to_string()),
        }
    }
    Ok((schema, rest))
}

/// Check that `payload` is well-formed under `encoding` without producing the encoded bytes.
pub fn validate_payload(encoding: &str, payload: &Value) -> Result<(), AbiError> {
    let schema = parse_encoding(encoding)?;
    coerce(&schema, payload, "$").map(|_| ())
}

/// ABI-encode `payload` under `encoding`, exactly as `abi.encode` would for the equivalent
/// Solidity value.
pub fn encode_payload(encoding: &str, payload: &Value) -> Result<Vec<u8>, AbiError> {
    let schema = parse_encoding(encoding)?;
    let value = coerce(&schema, payload, "$")?;
    Ok(value.abi_encode_params())
}

/// keccak of the canonical encoding; used for a transfer's `initial_state_hash`.
pub fn hash_payload(encoding: &str, payload: &Value) -> Result<B256, AbiError> {
    Ok(keccak256(encode_payload(encoding, payload)?))
}

/// An absent resolver: JSON null or an empty object. Treated as a cooperative cancellation when
/// resolving a transfer.
pub fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn coerce(schema: &Schema, value: &Value, field: &str) -> Result<DynSolValue, AbiError> {
    match schema {
        Schema::Primitive(ty) => coerce_primitive(ty, value, field),
        Schema::Tuple(fields) => {
            let mut out = Vec::with_capacity(fields.len());
            match value {
                Value::Object(map) => {
                    for (name, inner) in fields {
                        let item = map
                            .get(name)
                            .ok_or_else(|| AbiError::mismatch(field, format!("missing field '{name}'")))?;
                        out.push(coerce(inner, item, &format!("{field}.{name}"))?);
                    }
                    if map.len() != fields.len() {
                        return Err(AbiError::mismatch(field, "extra fields in payload"));
                    }
                }
                Value::Array(items) if items.len() == fields.len() => {
                    for ((name, inner), item) in fields.iter().zip(items) {
                        out.push(coerce(inner, item, &format!("{field}.{name}"))?);
                    }
                }
                _ => return Err(AbiError::mismatch(field, "expected an object or positional array")),
            }
            Ok(DynSolValue::Tuple(out))
        }
        Schema::Array(inner) => {
            let items = value
                .as_array()
                .ok_or_else(|| AbiError::mismatch(field, "expected an array"))?;
            let coerced = items
                .iter()
                .enumerate()
                .map(|(i, item)| coerce(inner, item, &format!("{field}[{i}]")))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(DynSolValue::Array(coerced))
        }
        Schema::FixedArray(inner, len) => {
            let items = value
                .as_array()
                .ok_or_else(|| AbiError::mismatch(field, "expected an array"))?;
            if items.len() != *len {
                return Err(AbiError::mismatch(field, format!("expected {len} elements, got {}", items.len())));
            }
            let coerced = items
                .iter()
                .enumerate()
                .map(|(i, item)| coerce(inner, item, &format!("{field}[{i}]")))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(DynSolValue::FixedArray(coerced))
        }
    }
}

fn coerce_primitive(ty: &DynSolType, value: &Value, field: &str) -> Result<DynSolValue, AbiError> {
    match ty {
        DynSolType::Address => {
            let s = expect_str(value, field)?;
            let address = s.parse().map_err(|_| AbiError::mismatch(field, format!("'{s}' is not an address")))?;
            Ok(DynSolValue::Address(address))
        }
        DynSolType::Bool => match value {
            Value::Bool(b) => Ok(DynSolValue::Bool(*b)),
            _ => Err(AbiError::mismatch(field, "expected a bool")),
        },
        DynSolType::Uint(bits) => Ok(DynSolValue::Uint(coerce_uint(value, field)?, *bits)),
        DynSolType::Int(bits) => Ok(DynSolValue::Int(coerce_int(value, field)?, *bits)),
        DynSolType::FixedBytes(len) => {
            let bytes = decode_hex(expect_str(value, field)?, field)?;
            if bytes.len() != *len {
                return Err(AbiError::mismatch(field, format!("expected {len} bytes, got {}", bytes.len())));
            }
            let mut word = B256::ZERO;
            word.0[..bytes.len()].copy_from_slice(&bytes);
            Ok(DynSolValue::FixedBytes(word, *len))
        }
        DynSolType::Bytes => Ok(DynSolValue::Bytes(decode_hex(expect_str(value, field)?, field)?)),
        DynSolType::String => Ok(DynSolValue::String(expect_str(value, field)?.to_string())),
        other => Err(AbiError::mismatch(field, format!("unsupported primitive type {other}"))),
    }
}

fn expect_str<'a>(value: &'a Value, field: &str) -> Result<&'a str, AbiError> {
    value.as_str().ok_or_else(|| AbiError::mismatch(field, "expected a string"))
}

fn decode_hex(s: &str, field: &str) -> Result<Vec<u8>, AbiError> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(stripped).map_err(|e| AbiError::mismatch(field, format!("invalid hex: {e}")))
}

fn coerce_uint(value: &Value, field: &str) -> Result<U256, AbiError> {
    match value {
        Value::Number(n) => {
            let n = n.as_u64().ok_or_else(|| AbiError::mismatch(field, "expected an unsigned integer"))?;
            Ok(U256::from(n))
        }
        Value::String(s) => {
            let (digits, radix) = match s.strip_prefix("0x") {
                Some(rest) => (rest, 16),
                None => (s.as_str(), 10),
            };
            U256::from_str_radix(digits, radix)
                .map_err(|_| AbiError::mismatch(field, format!("'{s}' is not an unsigned integer")))
        }
        _ => Err(AbiError::mismatch(field, "expected an unsigned integer")),
    }
}

fn coerce_int(value: &Value, field: &str) -> Result<I256, AbiError> {
    match value {
        Value::Number(n) => {
            let n = n.as_i64().ok_or_else(|| AbiError::mismatch(field, "expected an integer"))?;
            Ok(I256::try_from(n).expect("i64 always fits in I256"))
        }
        Value::String(s) => {
            I256::from_dec_str(s).map_err(|_| AbiError::mismatch(field, format!("'{s}' is not an integer")))
        }
        _ => Err(AbiError::mismatch(field, "expected an integer")),
    }
}
