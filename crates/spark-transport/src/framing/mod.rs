//! 帧记录与握手前导。
//!
//! 读取顺序：[`ConnectionModeReader`] 读出模式 → [`read_preamble`] 读出 via 与内容类型 →
//! 双工连接包装为 [`PendingSession`]，单例连接交给 [`SingletonRequestReader`]。

pub mod client;
pub mod mode_reader;
pub mod preamble;
pub mod record;
pub mod singleton;

pub use client::{ClientPreamble, singleton_request};
pub use mode_reader::ConnectionModeReader;
pub use preamble::{PendingSession, PreambleInfo, PreambleLimits, read_preamble};
pub use record::FramingMode;
pub use singleton::{SingletonRequest, SingletonRequestReader};
