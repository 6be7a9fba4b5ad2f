//! Conversions between native call arguments/results and Lua values. All
//! coercion here is tolerant: a result the script got wrong falls back to the
//! event's default with a log line, it never turns into a dispatch failure.

use std::ffi::CStr;
use std::os::raw::c_char;

use mlua::{Lua, Table, Value};
use tracing::warn;

use crate::encoding;

/// Reads a NUL-terminated native string argument. Null pointers marshal to
/// an empty string so handlers always see a string.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated buffer.
pub unsafe fn text_arg(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    encoding::to_utf8(CStr::from_ptr(ptr).to_bytes())
}

/// Coerces a gate handler's result into the native allow/deny code. Only a
/// boolean is a decision; nil (including "handler returned nothing") keeps
/// the default, and any other type is ignored with a warning.
pub fn gate_result(event: &str, value: &Value, default: u8) -> u8 {
    match value {
        Value::Boolean(allow) => *allow as u8,
        Value::Nil => default,
        other => {
            warn!(
                "{event}: ignoring non-boolean result ({}), using default",
                other.type_name()
            );
            default
        }
    }
}

pub enum ConnectionDecision {
    Gate(u8),
    Rename(String),
}

/// Like [`gate_result`], but a string result is a request to rewrite the
/// connecting player's name.
pub fn connection_result(event: &str, value: &Value, default: u8) -> ConnectionDecision {
    match value {
        Value::String(name) => match name.to_str() {
            Ok(name) => ConnectionDecision::Rename(name.to_owned()),
            Err(_) => {
                warn!("{event}: rename result is not valid UTF-8, using default");
                ConnectionDecision::Gate(default)
            }
        },
        other => ConnectionDecision::Gate(gate_result(event, other, default)),
    }
}

/// Writes a replacement name into the host's buffer: converted to the native
/// encoding, truncated to at most `capacity - 1` bytes without splitting a
/// two-byte character, always NUL-terminated. Returns the number of name
/// bytes written.
///
/// # Safety
/// `buffer` must be null or point to at least `capacity` writable bytes.
pub unsafe fn write_name_buffer(buffer: *mut c_char, capacity: usize, name: &str) -> usize {
    if buffer.is_null() || capacity == 0 {
        return 0;
    }
    let bytes = encoding::to_native(name);
    let len = char_boundary(&bytes, capacity - 1);
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), buffer as *mut u8, len);
    *buffer.add(len) = 0;
    len
}

/// Longest prefix of GBK-encoded `bytes` fitting in `max` that ends on a
/// character boundary. Lead bytes are >= 0x80 and carry one trail byte.
fn char_boundary(bytes: &[u8], max: usize) -> usize {
    let limit = max.min(bytes.len());
    let mut len = 0;
    while len < limit {
        let step = if bytes[len] < 0x80 { 1 } else { 2 };
        if len + step > limit {
            break;
        }
        len += step;
    }
    len
}

/// Builds the `server_performance_report` payload: a sequence of
/// `{label, duration}` rows preserving native emission order. A plain
/// string-keyed table would lose the order.
pub fn performance_report(lua: &Lua, entries: &[(String, u64)]) -> mlua::Result<Table> {
    let report = lua.create_table_with_capacity(entries.len(), 0)?;
    for (index, (label, duration)) in entries.iter().enumerate() {
        let row = lua.create_table_with_capacity(0, 2)?;
        row.set("label", label.as_str())?;
        row.set("duration", *duration)?;
        report.set(index + 1, row)?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn gate_accepts_only_booleans() {
        let lua = Lua::new();
        assert_eq!(gate_result("t", &Value::Boolean(true), 1), 1);
        assert_eq!(gate_result("t", &Value::Boolean(false), 1), 0);
        assert_eq!(gate_result("t", &Value::Nil, 1), 1);
        assert_eq!(gate_result("t", &Value::Integer(0), 1), 1);
        let text = lua.create_string("no").expect("string");
        assert_eq!(gate_result("t", &Value::String(text), 1), 1);
    }

    #[test]
    fn connection_result_recognizes_renames() {
        let lua = Lua::new();
        let name = lua.create_string("[CLAN]Tommy").expect("string");
        match connection_result("t", &Value::String(name), 1) {
            ConnectionDecision::Rename(n) => assert_eq!(n, "[CLAN]Tommy"),
            ConnectionDecision::Gate(_) => panic!("expected rename"),
        }
        match connection_result("t", &Value::Boolean(false), 1) {
            ConnectionDecision::Gate(code) => assert_eq!(code, 0),
            ConnectionDecision::Rename(_) => panic!("expected gate"),
        }
    }

    #[test]
    fn name_writeback_fits_exactly_at_capacity_minus_one() {
        let mut buffer = [0x7Fu8; 8];
        let written =
            unsafe { write_name_buffer(buffer.as_mut_ptr() as *mut c_char, 8, "Tommy12") };
        assert_eq!(written, 7);
        assert_eq!(&buffer[..7], b"Tommy12");
        assert_eq!(buffer[7], 0);
    }

    #[test]
    fn name_writeback_truncates_and_terminates() {
        let mut buffer = [0x7Fu8; 8];
        let written = unsafe {
            write_name_buffer(buffer.as_mut_ptr() as *mut c_char, 8, "TommyVercetti")
        };
        assert_eq!(written, 7);
        assert_eq!(&buffer[..7], b"TommyVe");
        assert_eq!(buffer[7], 0);
    }

    #[test]
    fn name_writeback_never_splits_a_multibyte_character() {
        // "你好" encodes to four GBK bytes; only the first character fits in
        // three, and a dangling lead byte must not be left behind.
        let mut buffer = [0x7Fu8; 4];
        let written = unsafe { write_name_buffer(buffer.as_mut_ptr() as *mut c_char, 4, "你好") };
        assert_eq!(written, 2);
        assert_eq!(&buffer[..2], &[0xC4, 0xE3]);
        assert_eq!(buffer[2], 0);
    }

    #[test]
    fn name_writeback_handles_degenerate_buffers() {
        assert_eq!(unsafe { write_name_buffer(std::ptr::null_mut(), 8, "x") }, 0);
        let mut buffer = [0x7Fu8; 1];
        let written = unsafe { write_name_buffer(buffer.as_mut_ptr() as *mut c_char, 1, "x") };
        assert_eq!(written, 0);
        assert_eq!(buffer[0], 0);
    }

    #[test]
    fn null_text_args_marshal_to_empty_strings() {
        assert_eq!(unsafe { text_arg(std::ptr::null()) }, "");
        let text = CString::new("hello").expect("cstring");
        assert_eq!(unsafe { text_arg(text.as_ptr()) }, "hello");
    }

    #[test]
    fn performance_report_preserves_emission_order() {
        let lua = Lua::new();
        let entries = vec![
            ("zeta".to_owned(), 30u64),
            ("alpha".to_owned(), 10u64),
            ("mid".to_owned(), 20u64),
        ];
        let report = performance_report(&lua, &entries).expect("report");
        assert_eq!(report.len().expect("len"), 3);
        let first: Table = report.get(1).expect("row");
        assert_eq!(first.get::<String>("label").expect("label"), "zeta");
        assert_eq!(first.get::<u64>("duration").expect("duration"), 30);
        let third: Table = report.get(3).expect("row");
        assert_eq!(third.get::<String>("label").expect("label"), "mid");
    }
}
