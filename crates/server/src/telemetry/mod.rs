/// 遥测数据模块
///
/// Bot 通过 generic_message 上报的数据先进入内存缓冲区，由定时任务按 (Bot, 日期) 追加写入文件

pub mod buffer;
pub mod flusher;
pub mod store;

pub use buffer::TelemetryBuffer;
pub use flusher::TelemetryFlusher;
pub use store::{DataFileInfo, FileTelemetryStore, TelemetryStore};
