//! 记忆层：消息与历史压缩、中英文分词、带压力清理的内存管理器

pub mod conversation;
pub mod manager;
pub mod tokenizer;

pub use conversation::{compact_history, history_bytes, Message, Role};
pub use manager::{CleanupCallback, CleanupReport, MemoryManager, MemoryStats, PurgeHook, WeakCache};
pub use tokenizer::{contains_cjk, jaccard_similarity, overlap_ratio, tokenize, tokenize_to_set};
