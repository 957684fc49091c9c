//! Resolving kernel tracepoints by name through tracefs.
//!
//! The engine binds to `sched_switch`, `sched_process_fork`, and
//! `sched_process_exit` by string name: it walks every event directory under
//! tracefs and matches names, and a missing tracepoint aborts startup with
//! an error naming it. Each bound tracepoint carries its perf id (the
//! `PERF_TYPE_TRACEPOINT` config value) and the field layout parsed from the
//! event's `format` file, which is what lets the feed decode raw sample
//! payloads without hard-coding offsets.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::Error;

pub(crate) const SCHED_SWITCH: &str = "sched_switch";
pub(crate) const SCHED_PROCESS_FORK: &str = "sched_process_fork";
pub(crate) const SCHED_PROCESS_EXIT: &str = "sched_process_exit";

/// One field of a tracepoint's raw payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldDesc {
    /// Field name, with any array suffix stripped (`prev_comm[16]` becomes
    /// `prev_comm`).
    pub name: String,
    /// Byte offset into the raw payload.
    pub offset: usize,
    /// Field size in bytes.
    pub size: usize,
}

/// A tracepoint resolved from tracefs: its perf id plus payload layout.
#[derive(Clone, Debug)]
pub struct TracepointDesc {
    /// The tracepoint name, e.g. `sched_switch`.
    pub name: String,
    /// The id to program into `perf_event_attr.config`.
    pub id: u32,
    /// The payload fields, common header fields included.
    pub fields: Vec<FieldDesc>,
}

impl TracepointDesc {
    fn load(dir: &Path, name: &str) -> io::Result<TracepointDesc> {
        let id = fs::read_to_string(dir.join("id"))?
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let fields = parse_format(&fs::read_to_string(dir.join("format"))?);
        Ok(TracepointDesc {
            name: name.to_owned(),
            id,
            fields,
        })
    }

    /// Look a field up by name.
    pub fn field(&self, name: &str) -> Option<&FieldDesc> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Decode a 4-byte signed field (pids and the like) from a payload.
    pub fn read_i32(&self, payload: &[u8], name: &str) -> Option<i32> {
        let field = self.field(name)?;
        if field.size != 4 {
            return None;
        }
        let bytes = payload.get(field.offset..field.offset + 4)?;
        Some(i32::from_ne_bytes(bytes.try_into().ok()?))
    }

    /// Decode a fixed-size comm field from a payload, up to the first NUL.
    pub fn read_comm(&self, payload: &[u8], name: &str) -> Option<String> {
        let field = self.field(name)?;
        let bytes = payload.get(field.offset..field.offset + field.size)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

/// The three sched tracepoints the engine subscribes to.
#[derive(Clone, Debug)]
pub struct SchedTracepoints {
    /// `sched_switch`.
    pub switch: TracepointDesc,
    /// `sched_process_fork`.
    pub fork: TracepointDesc,
    /// `sched_process_exit`.
    pub exit: TracepointDesc,
}

/// Locate the tracefs `events` directory.
pub fn tracefs_events_root() -> Result<PathBuf, Error> {
    for base in ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"] {
        let events = Path::new(base).join("events");
        if events.is_dir() {
            return Ok(events);
        }
    }
    Err(Error::TracefsNotFound)
}

/// Walk every registered event under `events_root` and bind the three sched
/// tracepoints by name.
pub fn bind_sched_tracepoints(events_root: &Path) -> Result<SchedTracepoints, Error> {
    let mut switch = None;
    let mut fork = None;
    let mut exit = None;

    for subsys in fs::read_dir(events_root)? {
        let subsys = subsys?;
        if !subsys.file_type()?.is_dir() {
            continue;
        }
        for event in fs::read_dir(subsys.path())? {
            let event = event?;
            if !event.file_type()?.is_dir() {
                continue;
            }
            let name = event.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let slot = match name {
                SCHED_SWITCH => &mut switch,
                SCHED_PROCESS_FORK => &mut fork,
                SCHED_PROCESS_EXIT => &mut exit,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(TracepointDesc::load(&event.path(), name)?);
            }
        }
    }

    Ok(SchedTracepoints {
        switch: switch.ok_or(Error::TracepointMissing(SCHED_SWITCH))?,
        fork: fork.ok_or(Error::TracepointMissing(SCHED_PROCESS_FORK))?,
        exit: exit.ok_or(Error::TracepointMissing(SCHED_PROCESS_EXIT))?,
    })
}

/// Parse a tracefs `format` file into field descriptors.
///
/// Each field line looks like
/// `field:pid_t prev_pid; offset:24; size:4; signed:1;`.
fn parse_format(text: &str) -> Vec<FieldDesc> {
    let mut fields = Vec::new();
    for line in text.lines() {
        let Some(rest) = line.trim().strip_prefix("field:") else {
            continue;
        };
        let mut name = None;
        let mut offset = None;
        let mut size = None;
        for part in rest.split(';') {
            let part = part.trim();
            if let Some(v) = part.strip_prefix("offset:") {
                offset = v.trim().parse().ok();
            } else if let Some(v) = part.strip_prefix("size:") {
                size = v.trim().parse().ok();
            } else if part.starts_with("signed:") || part.is_empty() {
                continue;
            } else {
                // The declaration itself; the name is its last token, with
                // any array length stripped.
                name = part
                    .split_whitespace()
                    .last()
                    .map(|n| n.split('[').next().unwrap_or(n).to_owned());
            }
        }
        if let (Some(name), Some(offset), Some(size)) = (name, offset, size) {
            fields.push(FieldDesc { name, offset, size });
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SWITCH_FORMAT: &str = "\
name: sched_switch
ID: 316
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

\tfield:char prev_comm[16];\toffset:8;\tsize:16;\tsigned:0;
\tfield:pid_t prev_pid;\toffset:24;\tsize:4;\tsigned:1;
\tfield:int prev_prio;\toffset:28;\tsize:4;\tsigned:1;
\tfield:long prev_state;\toffset:32;\tsize:8;\tsigned:1;
\tfield:char next_comm[16];\toffset:40;\tsize:16;\tsigned:0;
\tfield:pid_t next_pid;\toffset:56;\tsize:4;\tsigned:1;
\tfield:int next_prio;\toffset:60;\tsize:4;\tsigned:1;
";

    fn write_event(root: &Path, subsys: &str, name: &str, id: u32, format: &str) {
        let dir = root.join(subsys).join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("id"), format!("{}\n", id)).unwrap();
        fs::write(dir.join("format"), format).unwrap();
    }

    fn fake_tracefs() -> TempDir {
        let dir = TempDir::new().unwrap();
        write_event(dir.path(), "sched", SCHED_SWITCH, 316, SWITCH_FORMAT);
        write_event(dir.path(), "sched", SCHED_PROCESS_FORK, 317, SWITCH_FORMAT);
        write_event(dir.path(), "sched", SCHED_PROCESS_EXIT, 318, SWITCH_FORMAT);
        // Noise that must be skipped, not tripped over.
        write_event(dir.path(), "irq", "irq_handler_entry", 90, "format:\n");
        dir
    }

    #[test]
    fn binds_all_three_by_name() {
        let dir = fake_tracefs();
        let tps = bind_sched_tracepoints(dir.path()).unwrap();
        assert_eq!(tps.switch.id, 316);
        assert_eq!(tps.fork.id, 317);
        assert_eq!(tps.exit.id, 318);
    }

    #[test]
    fn each_missing_tracepoint_reports_its_name() {
        let dir = TempDir::new().unwrap();
        write_event(dir.path(), "sched", SCHED_SWITCH, 316, SWITCH_FORMAT);
        write_event(dir.path(), "sched", SCHED_PROCESS_EXIT, 318, SWITCH_FORMAT);
        match bind_sched_tracepoints(dir.path()) {
            Err(Error::TracepointMissing(name)) => assert_eq!(name, SCHED_PROCESS_FORK),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn format_fields_parse_with_offsets() {
        let fields = parse_format(SWITCH_FORMAT);
        let prev_pid = fields.iter().find(|f| f.name == "prev_pid").unwrap();
        assert_eq!(prev_pid.offset, 24);
        assert_eq!(prev_pid.size, 4);
        let prev_comm = fields.iter().find(|f| f.name == "prev_comm").unwrap();
        assert_eq!(prev_comm.offset, 8);
        assert_eq!(prev_comm.size, 16);
    }

    #[test]
    fn payload_decoding() {
        let dir = fake_tracefs();
        let tps = bind_sched_tracepoints(dir.path()).unwrap();

        let mut payload = vec![0_u8; 64];
        payload[8..12].copy_from_slice(b"cc1\0");
        payload[24..28].copy_from_slice(&4321_i32.to_ne_bytes());
        assert_eq!(tps.switch.read_i32(&payload, "prev_pid"), Some(4321));
        assert_eq!(tps.switch.read_comm(&payload, "prev_comm").unwrap(), "cc1");
        assert_eq!(tps.switch.read_i32(&payload, "no_such_field"), None);
        // A truncated payload decodes to nothing rather than panicking.
        assert_eq!(tps.switch.read_i32(&payload[..10], "prev_pid"), None);
    }
}
