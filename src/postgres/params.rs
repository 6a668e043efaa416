use std::error::Error;

use tokio_postgres::types::{FromSql, IsNull, Kind, ToSql, Type, to_sql_checked};
use tokio_util::bytes::{BufMut, BytesMut};

use crate::types::DbValue;

type BoxError = Box<dyn Error + Sync + Send>;

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

impl ToSql for DbValue {
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            DbValue::Null => Ok(IsNull::Yes),
            DbValue::Int(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::FLOAT8 => (*v as f64).to_sql(ty, out),
                Type::NUMERIC => encode_numeric(&v.to_string(), out),
                Type::BOOL => (*v != 0).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR => v.to_string().to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            DbValue::Float(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::NUMERIC => encode_numeric(&v.to_string(), out),
                _ => v.to_sql(ty, out),
            },
            DbValue::Decimal(text) => match *ty {
                Type::NUMERIC => encode_numeric(text, out),
                Type::FLOAT4 | Type::FLOAT8 => DbValue::Float(text.trim().parse()?).to_sql(ty, out),
                Type::INT2 | Type::INT4 | Type::INT8 => {
                    DbValue::Int(text.trim().parse()?).to_sql(ty, out)
                }
                _ => text.as_str().to_sql(ty, out),
            },
            DbValue::Text(s) => s.as_str().to_sql(ty, out),
            DbValue::Bool(b) => b.to_sql(ty, out),
            DbValue::Timestamp(ts) => match *ty {
                Type::DATE => ts.date().to_sql(ty, out),
                Type::TIMESTAMPTZ => ts.and_utc().to_sql(ty, out),
                _ => ts.to_sql(ty, out),
            },
            DbValue::Date(date) => match *ty {
                Type::TIMESTAMP | Type::TIMESTAMPTZ => {
                    DbValue::Timestamp(date.and_hms_opt(0, 0, 0).ok_or("invalid date")?)
                        .to_sql(ty, out)
                }
                _ => date.to_sql(ty, out),
            },
            DbValue::Json(json) => json.to_sql(ty, out),
            DbValue::Blob(bytes) => bytes.as_slice().to_sql(ty, out),
            DbValue::Array(values) => values.to_sql(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        if let Kind::Array(member) = ty.kind() {
            return Self::accepts(member);
        }
        matches!(
            *ty,
            Type::INT2
                | Type::INT4
                | Type::INT8
                | Type::FLOAT4
                | Type::FLOAT8
                | Type::NUMERIC
                | Type::TEXT
                | Type::VARCHAR
                | Type::BPCHAR
                | Type::NAME
                | Type::UNKNOWN
                | Type::BOOL
                | Type::TIMESTAMP
                | Type::TIMESTAMPTZ
                | Type::DATE
                | Type::JSON
                | Type::JSONB
                | Type::BYTEA
        )
    }

    to_sql_checked!();
}

/// `numeric` column read as its exact decimal text.
pub(super) struct NumericText(pub String);

impl<'a> FromSql<'a> for NumericText {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        decode_numeric(raw).map(NumericText)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

fn digit_group(chunk: &[u8]) -> i16 {
    chunk
        .iter()
        .fold(0i16, |acc, b| acc * 10 + i16::from(b - b'0'))
}

/// Encode decimal text in the binary `numeric` format (base-10000 digit groups).
fn encode_numeric(text: &str, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("nan") {
        out.put_i16(0);
        out.put_i16(0);
        out.put_u16(NUMERIC_NAN);
        out.put_u16(0);
        return Ok(IsNull::No);
    }
    let (negative, unsigned) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    if (int_part.is_empty() && frac_part.is_empty())
        || !int_part
            .bytes()
            .chain(frac_part.bytes())
            .all(|b| b.is_ascii_digit())
    {
        return Err(format!("invalid numeric literal '{text}'").into());
    }

    let dscale = u16::try_from(frac_part.len())?;
    let int_part = int_part.trim_start_matches('0');
    let padded_int = format!("{}{int_part}", "0".repeat((4 - int_part.len() % 4) % 4));
    let padded_frac = format!("{frac_part}{}", "0".repeat((4 - frac_part.len() % 4) % 4));

    let mut digits: Vec<i16> = padded_int.as_bytes().chunks(4).map(digit_group).collect();
    let mut weight = i16::try_from(digits.len())? - 1;
    digits.extend(padded_frac.as_bytes().chunks(4).map(digit_group));

    let leading = digits.iter().take_while(|d| **d == 0).count();
    digits.drain(..leading);
    weight -= i16::try_from(leading)?;
    while digits.last() == Some(&0) {
        digits.pop();
    }
    if digits.is_empty() {
        weight = 0;
    }

    out.put_i16(i16::try_from(digits.len())?);
    out.put_i16(weight);
    out.put_u16(if negative && !digits.is_empty() {
        NUMERIC_NEG
    } else {
        NUMERIC_POS
    });
    out.put_u16(dscale);
    for digit in digits {
        out.put_i16(digit);
    }
    Ok(IsNull::No)
}

fn decode_numeric(raw: &[u8]) -> Result<String, BoxError> {
    let header = raw.get(..8).ok_or("numeric value too short")?;
    let ndigits = usize::try_from(i16::from_be_bytes([header[0], header[1]]))?;
    let weight = i32::from(i16::from_be_bytes([header[2], header[3]]));
    let sign = u16::from_be_bytes([header[4], header[5]]);
    let dscale = usize::from(u16::from_be_bytes([header[6], header[7]]));
    if sign == NUMERIC_NAN {
        return Ok("NaN".to_string());
    }
    let digits: Vec<i16> = raw[8..]
        .chunks_exact(2)
        .take(ndigits)
        .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    if digits.len() != ndigits {
        return Err("numeric value truncated".into());
    }
    let digit_at = |idx: i32| -> i16 {
        usize::try_from(idx)
            .ok()
            .and_then(|idx| digits.get(idx))
            .copied()
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for idx in 0..=weight {
            if idx == 0 {
                out.push_str(&digit_at(idx).to_string());
            } else {
                out.push_str(&format!("{:04}", digit_at(idx)));
            }
        }
    }
    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut idx = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", digit_at(idx)));
            idx += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Ok(out)
}
