//! Loss-free formatting of native event flags.
//!
//! Formatting is observability-only: reactors and backends never branch on
//! the strings produced here. Every set flag is reported with an independent
//! bit test, and whatever bits remain after the known flags are masked off
//! are appended as a hex residue instead of being dropped. A record with
//! both hangup and error set therefore names both.

use std::fmt::Write as _;

/// One known flag: its bit pattern and display name.
pub type FlagName = (u32, &'static str);

/// Renders `bits` against a flag table.
///
/// Each table entry whose bits are fully present is named; leftover bits are
/// appended as `0x…`. All-zero input renders as `(none)`.
#[must_use]
pub fn render_flags(bits: u32, table: &[FlagName]) -> String {
    let mut out = String::new();
    let mut recognized = 0u32;
    for &(flag, name) in table {
        if flag != 0 && (bits & flag) == flag {
            if !out.is_empty() {
                out.push_str(" | ");
            }
            out.push_str(name);
            recognized |= flag;
        }
    }

    let residue = bits & !recognized;
    if residue != 0 {
        if !out.is_empty() {
            out.push_str(" | ");
        }
        let _ = write!(out, "{residue:#x}");
    }

    if out.is_empty() {
        out.push_str("(none)");
    }
    out
}

/// Known epoll event flags, by numeric value so descriptions work on every
/// host (values are fixed by the Linux ABI).
pub const EPOLL_FLAGS: &[FlagName] = &[
    (0x001, "EPOLLIN"),
    (0x004, "EPOLLOUT"),
    (0x002, "EPOLLPRI"),
    (0x008, "EPOLLERR"),
    (0x010, "EPOLLHUP"),
    (0x2000, "EPOLLRDHUP"),
    (0x4000_0000, "EPOLLONESHOT"),
    (0x8000_0000, "EPOLLET"),
];

/// Known kqueue `flags` bits (fixed by the BSD ABI).
pub const KEVENT_FLAGS: &[FlagName] = &[
    (0x0001, "EV_ADD"),
    (0x0002, "EV_DELETE"),
    (0x0004, "EV_ENABLE"),
    (0x0008, "EV_DISABLE"),
    (0x0010, "EV_ONESHOT"),
    (0x0020, "EV_CLEAR"),
    (0x4000, "EV_ERROR"),
    (0x8000, "EV_EOF"),
];

/// Describes an epoll event word, e.g. `"EPOLLIN | EPOLLHUP"`.
#[must_use]
pub fn describe_epoll(events: u32) -> String {
    render_flags(events, EPOLL_FLAGS)
}

/// Describes a kqueue record's filter and flag word,
/// e.g. `"EVFILT_READ: EV_EOF"`.
#[must_use]
pub fn describe_kevent(filter: i16, flags: u16) -> String {
    let filter_name = match filter {
        -1 => "EVFILT_READ".to_string(),
        -2 => "EVFILT_WRITE".to_string(),
        other => format!("filter({other})"),
    };
    format!(
        "{filter_name}: {}",
        render_flags(u32::from(flags), KEVENT_FLAGS)
    )
}
