//! Outbound message formatting (manager -> worker).
//!
//! Each function returns the bytes to place on the wire, header line(s)
//! included. Multi-part messages (those with a following binary/text
//! block) return the header line and the caller is responsible for
//! writing the payload bytes immediately after — this mirrors
//! `ds_manager_send` followed by `link_putlstring` in the original
//! implementation, which never buffers the payload into the same string.

/// Percent-encode a remote file name the way the original manager does
/// before putting it on an `infile`/`outfile` line, so that embedded
/// spaces or control bytes can't be mistaken for field separators.
pub fn url_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

pub fn release() -> String {
    "release\n".to_string()
}

pub fn exit() -> String {
    "exit\n".to_string()
}

pub fn check() -> String {
    "check\n".to_string()
}

pub fn kill(taskid: u64) -> String {
    format!("kill {taskid}\n")
}

pub fn unlink(name: &str) -> String {
    format!("unlink {name}\n")
}

pub fn send_results(n: i64) -> String {
    format!("send_results {n}\n")
}

/// An input or output file reference on a task-start sequence.
#[derive(Debug, Clone)]
pub struct FileSpec {
    pub cached_name: String,
    pub remote_name: String,
    pub flags: u32,
    pub is_directory: bool,
}

/// Builds the `task ID` .. `end` sequence described in spec.md §4.1.
/// Returns the full sequence as a single string; binary `cmd`/`coprocess`
/// bodies are passed in as already-decoded UTF-8 here because in this
/// system the command line and coprocess command are themselves text —
/// a real byte-oriented payload (e.g. a binary env blob) would be
/// written by the caller directly after the corresponding header line
/// the same way `cmd`/`env` headers are, which is why those headers are
/// exposed individually below for streaming use.
pub struct TaskStartHeader;

impl TaskStartHeader {
    pub fn task_line(taskid: u64) -> String {
        format!("task {taskid}\n")
    }

    pub fn cmd_header(command_line: &str) -> String {
        format!("cmd {}\n", command_line.len())
    }

    pub fn coprocess_header(coprocess: &str) -> String {
        format!("coprocess {}\n", coprocess.len())
    }

    pub fn category_line(category: &str) -> String {
        format!("category {category}\n")
    }

    pub fn cores_line(v: i64) -> String {
        format!("cores {v}\n")
    }

    pub fn gpus_line(v: i64) -> String {
        format!("gpus {v}\n")
    }

    pub fn memory_line(v: i64) -> String {
        format!("memory {v}\n")
    }

    pub fn disk_line(v: i64) -> String {
        format!("disk {v}\n")
    }

    pub fn end_time_line(v: i64) -> String {
        format!("end_time {v}\n")
    }

    pub fn wall_time_line(v: i64) -> String {
        format!("wall_time {v}\n")
    }

    pub fn env_header(var: &str) -> String {
        format!("env {}\n", var.len())
    }

    pub fn dir_line(remote_name: &str) -> String {
        format!("dir {}\n", url_encode(remote_name))
    }

    pub fn infile_line(spec: &FileSpec) -> String {
        format!(
            "infile {} {} {}\n",
            spec.cached_name,
            url_encode(&spec.remote_name),
            spec.flags
        )
    }

    pub fn outfile_line(spec: &FileSpec) -> String {
        format!(
            "outfile {} {} {}\n",
            spec.cached_name,
            url_encode(&spec.remote_name),
            spec.flags
        )
    }

    pub fn end() -> String {
        "end\n".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encode_leaves_safe_chars_alone() {
        assert_eq!(url_encode("a/b-c_d.e~f"), "a/b-c_d.e~f");
    }

    #[test]
    fn url_encode_escapes_space_and_percent() {
        assert_eq!(url_encode("a b%c"), "a%20b%25c");
    }

    #[test]
    fn kill_and_unlink_format() {
        assert_eq!(kill(7), "kill 7\n");
        assert_eq!(unlink("foo"), "unlink foo\n");
    }

    #[test]
    fn infile_line_encodes_remote_name() {
        let spec = FileSpec {
            cached_name: "abc123".into(),
            remote_name: "my file.txt".into(),
            flags: 1,
            is_directory: false,
        };
        assert_eq!(
            TaskStartHeader::infile_line(&spec),
            "infile abc123 my%20file.txt 1\n"
        );
    }
}
