//! Small shared helpers: text segmentation/cleanup and the quick-reply
//! audio cache.

pub mod quick_reply;
pub mod text;
