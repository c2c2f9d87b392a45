//! App - [`Engine`](crate::engine::Engine) のバックグラウンド処理
//!
//! # Components
//! - **ReaperLoop**: 定期 timeout sweep (waiter がいない record も回収)

pub mod reaper_loop;

pub use self::reaper_loop::ReaperLoop;
