//! Utilities module - Common helpers for prompt text handling

pub mod text_utils;

pub use text_utils::TextUtils;
