mod session;

pub use session::{format_duration, parse_label, parse_tag_list, ParsedLabel, Session};
pub(crate) use session::push_unique;
