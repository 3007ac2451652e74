//! Common utilities for native SDK drivers
//!
//! This module provides:
//! - The vendor HRESULT codes shared by every driver
//! - Safe conversion of fixed-size SDK string arrays

use std::ffi::c_char;

// =============================================================================
// RESULT CODES
// =============================================================================

/// HRESULT codes returned by the nncam SDK family
pub mod hresult {
    pub const S_OK: i32 = 0x0000_0000;
    pub const S_FALSE: i32 = 0x0000_0001;
    pub const E_PENDING: i32 = 0x8000_000a_u32 as i32;
    pub const E_NOTIMPL: i32 = 0x8000_4001_u32 as i32;
    pub const E_FAIL: i32 = 0x8000_4005_u32 as i32;
    pub const E_UNEXPECTED: i32 = 0x8000_ffff_u32 as i32;
    pub const E_TIMEOUT: i32 = 0x8001_011f_u32 as i32;
    pub const E_ACCESSDENIED: i32 = 0x8007_0005_u32 as i32;
    pub const E_GEN_FAILURE: i32 = 0x8007_001f_u32 as i32;
    pub const E_INVALIDARG: i32 = 0x8007_0057_u32 as i32;
    pub const E_BUSY: i32 = 0x8007_00aa_u32 as i32;

    /// Negative HRESULTs are failures
    pub fn failed(code: i32) -> bool {
        code < 0
    }

    /// Symbolic name for logs
    pub fn name(code: i32) -> &'static str {
        match code {
            S_OK => "S_OK",
            S_FALSE => "S_FALSE",
            E_PENDING => "E_PENDING",
            E_NOTIMPL => "E_NOTIMPL",
            E_FAIL => "E_FAIL",
            E_UNEXPECTED => "E_UNEXPECTED",
            E_TIMEOUT => "E_TIMEOUT",
            E_ACCESSDENIED => "E_ACCESSDENIED",
            E_GEN_FAILURE => "E_GEN_FAILURE",
            E_INVALIDARG => "E_INVALIDARG",
            E_BUSY => "E_BUSY",
            _ => "UNKNOWN",
        }
    }
}

// =============================================================================
// SAFE STRING CONVERSION
// =============================================================================

/// Convert a fixed-size C char array to a String, stopping at the first NUL.
pub fn char_array_to_string(arr: &[c_char]) -> String {
    let bytes: Vec<u8> = arr
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Convert a fixed-size UTF-16 array to a String, stopping at the first NUL.
pub fn wide_array_to_string(arr: &[u16]) -> String {
    let len = arr.iter().position(|&c| c == 0).unwrap_or(arr.len());
    String::from_utf16_lossy(&arr[..len])
}

/// Read a NUL-terminated C string pointer, bounded by `max_len` bytes.
///
/// # Safety
/// `ptr` must be null or point to at least `max_len` readable bytes or to a
/// NUL-terminated string shorter than that.
pub unsafe fn cstr_ptr_to_string(ptr: *const c_char, max_len: usize) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let mut len = 0;
    while len < max_len && *ptr.add(len) != 0 {
        len += 1;
    }
    let slice = std::slice::from_raw_parts(ptr as *const u8, len);
    String::from_utf8_lossy(slice).into_owned()
}

/// Read a NUL-terminated UTF-16 string pointer, bounded by `max_len` units.
///
/// # Safety
/// Same contract as `cstr_ptr_to_string`, in UTF-16 code units.
pub unsafe fn wide_ptr_to_string(ptr: *const u16, max_len: usize) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let mut len = 0;
    while len < max_len && *ptr.add(len) != 0 {
        len += 1;
    }
    String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
}
