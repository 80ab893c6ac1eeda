// Helper functions for reading JDWP data types from buffers
//
// Every reader checks the remaining length first; a short buffer is a
// protocol violation, never a panic.

use crate::protocol::{JdwpError, JdwpResult};
use crate::types::{Location, ObjectId, Value, ValueData};
use bytes::Buf;

fn short(what: &str) -> JdwpError {
    JdwpError::ProtocolViolation(format!("Not enough data for {}", what))
}

/// Read a JDWP string (4-byte length prefix + UTF-8 bytes)
pub fn read_string(buf: &mut &[u8]) -> JdwpResult<String> {
    if buf.remaining() < 4 {
        return Err(short("string length"));
    }

    let len = buf.get_u32() as usize;

    if buf.remaining() < len {
        return Err(JdwpError::ProtocolViolation(format!(
            "Not enough data for string: expected {}, got {}",
            len,
            buf.remaining()
        )));
    }

    let bytes = &buf[..len];
    buf.advance(len);

    String::from_utf8(bytes.to_vec())
        .map_err(|e| JdwpError::ProtocolViolation(format!("Invalid UTF-8 in string: {}", e)))
}

/// Read a u32
pub fn read_u32(buf: &mut &[u8]) -> JdwpResult<u32> {
    if buf.remaining() < 4 {
        return Err(short("u32"));
    }
    Ok(buf.get_u32())
}

/// Read a i32
pub fn read_i32(buf: &mut &[u8]) -> JdwpResult<i32> {
    if buf.remaining() < 4 {
        return Err(short("i32"));
    }
    Ok(buf.get_i32())
}

/// Read a u8
pub fn read_u8(buf: &mut &[u8]) -> JdwpResult<u8> {
    if buf.remaining() < 1 {
        return Err(short("u8"));
    }
    Ok(buf.get_u8())
}

/// Read a boolean (one byte, non-zero is true)
pub fn read_bool(buf: &mut &[u8]) -> JdwpResult<bool> {
    Ok(read_u8(buf)? != 0)
}

/// Read a u64
pub fn read_u64(buf: &mut &[u8]) -> JdwpResult<u64> {
    if buf.remaining() < 8 {
        return Err(short("u64"));
    }
    Ok(buf.get_u64())
}

/// Read a location (type tag, class, method, index)
pub fn read_location(buf: &mut &[u8]) -> JdwpResult<Location> {
    let type_tag = read_u8(buf)?;
    let class_id = read_u64(buf)?;
    let method_id = read_u64(buf)?;
    let index = read_u64(buf)?;

    Ok(Location {
        type_tag,
        class_id,
        method_id,
        index,
    })
}

/// Read a tagged object id; the tag byte is discarded
pub fn read_tagged_object(buf: &mut &[u8]) -> JdwpResult<ObjectId> {
    let _tag = read_u8(buf)?;
    read_u64(buf)
}

/// Read a tagged value (tag byte followed by the value)
pub fn read_value(buf: &mut &[u8]) -> JdwpResult<Value> {
    let tag = read_u8(buf)?;
    let data = read_value_by_tag(tag, buf)?;
    Ok(Value { tag, data })
}

/// Read a value based on its type tag
pub fn read_value_by_tag(tag: u8, buf: &mut &[u8]) -> JdwpResult<ValueData> {
    let need = match tag {
        b'B' | b'Z' => 1,
        b'C' | b'S' => 2,
        b'F' | b'I' => 4,
        b'D' | b'J' => 8,
        b'V' => 0,
        b'L' | b's' | b't' | b'g' | b'l' | b'c' | b'[' => 8,
        _ => {
            return Err(JdwpError::ProtocolViolation(format!(
                "Unknown value tag: {}",
                tag
            )))
        }
    };

    if buf.remaining() < need {
        return Err(short("value"));
    }

    Ok(match tag {
        b'B' => ValueData::Byte(buf.get_i8()),
        b'C' => ValueData::Char(buf.get_u16()),
        b'D' => ValueData::Double(buf.get_f64()),
        b'F' => ValueData::Float(buf.get_f32()),
        b'I' => ValueData::Int(buf.get_i32()),
        b'J' => ValueData::Long(buf.get_i64()),
        b'S' => ValueData::Short(buf.get_i16()),
        b'Z' => ValueData::Boolean(buf.get_u8() != 0),
        b'V' => ValueData::Void,
        _ => ValueData::Object(buf.get_u64()),
    })
}
