use crate::ProtocolError;

/// The protocol version this implementation speaks. A greeting carrying
/// any other value is a hard mismatch (spec.md §4.1, §6).
pub const PROTOCOL_VERSION: u32 = 18;

/// A header line, parsed but (for payload-bearing kinds) not yet
/// completed with its trailing bytes. The caller reads exactly
/// [`InboundHeader::payload_len`] bytes off the wire and passes them to
/// [`InboundHeader::finish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundHeader {
    Greeting {
        version: u32,
        host: String,
        os: String,
        arch: String,
        software_version: String,
    },
    Alive,
    Info {
        key: String,
        value: String,
    },
    Resource {
        name: String,
        total: f64,
        smallest: f64,
        largest: f64,
    },
    ResourceTag {
        tag: String,
    },
    Feature {
        name: String,
    },
    CacheUpdate {
        name: String,
        size: u64,
        transfer_time_usec: u64,
    },
    CacheInvalidHeader {
        name: String,
        reason_len: u64,
    },
    TransferAddress {
        host: String,
        port: u16,
    },
    AvailableResults,
    ResultHeader {
        status: i32,
        exit_code: i32,
        output_len: u64,
        exec_usec: u64,
        taskid: u64,
    },
    UpdateHeader {
        taskid: u64,
        path: String,
        offset: u64,
        len: u64,
    },
    End,
    QueueStatus,
    WorkerStatus,
    TaskStatus,
    WableStatus,
    ResourcesStatus,
    Name,
    Auth,
    Http {
        method: String,
        path: String,
        version: String,
    },
}

impl InboundHeader {
    /// Bytes of payload that must be read off the wire before this header
    /// can be finished into a message. Zero for header-only messages.
    pub fn payload_len(&self) -> u64 {
        match self {
            InboundHeader::CacheInvalidHeader { reason_len, .. } => *reason_len,
            InboundHeader::ResultHeader { output_len, .. } => *output_len,
            InboundHeader::UpdateHeader { len, .. } => *len,
            _ => 0,
        }
    }

    /// Complete the header with its payload (empty for header-only
    /// messages) into a finished message.
    pub fn finish(self, payload: Vec<u8>) -> Result<InboundMessage, ProtocolError> {
        Ok(match self {
            InboundHeader::Greeting {
                version,
                host,
                os,
                arch,
                software_version,
            } => InboundMessage::Greeting {
                version,
                host,
                os,
                arch,
                software_version,
            },
            InboundHeader::Alive => InboundMessage::Alive,
            InboundHeader::Info { key, value } => InboundMessage::Info { key, value },
            InboundHeader::Resource {
                name,
                total,
                smallest,
                largest,
            } => InboundMessage::Resource {
                name,
                total,
                smallest,
                largest,
            },
            InboundHeader::ResourceTag { tag } => InboundMessage::ResourceTag { tag },
            InboundHeader::Feature { name } => InboundMessage::Feature { name },
            InboundHeader::CacheUpdate {
                name,
                size,
                transfer_time_usec,
            } => InboundMessage::CacheUpdate {
                name,
                size,
                transfer_time_usec,
            },
            InboundHeader::CacheInvalidHeader { name, .. } => InboundMessage::CacheInvalid {
                name,
                reason: String::from_utf8_lossy(&payload).into_owned(),
            },
            InboundHeader::TransferAddress { host, port } => {
                InboundMessage::TransferAddress { host, port }
            }
            InboundHeader::AvailableResults => InboundMessage::AvailableResults,
            InboundHeader::ResultHeader {
                status,
                exit_code,
                output_len,
                exec_usec,
                taskid,
            } => InboundMessage::Result {
                status,
                exit_code,
                output_len,
                exec_usec,
                taskid,
                stdout: payload,
            },
            InboundHeader::UpdateHeader {
                taskid,
                path,
                offset,
                len,
            } => InboundMessage::Update {
                taskid,
                path,
                offset,
                len,
                data: payload,
            },
            InboundHeader::End => InboundMessage::End,
            InboundHeader::QueueStatus => InboundMessage::QueueStatus,
            InboundHeader::WorkerStatus => InboundMessage::WorkerStatus,
            InboundHeader::TaskStatus => InboundMessage::TaskStatus,
            InboundHeader::WableStatus => InboundMessage::WableStatus,
            InboundHeader::ResourcesStatus => InboundMessage::ResourcesStatus,
            InboundHeader::Name => InboundMessage::Name,
            InboundHeader::Auth => InboundMessage::Auth,
            InboundHeader::Http {
                method,
                path,
                version,
            } => InboundMessage::Http {
                method,
                path,
                version,
            },
        })
    }
}

/// A fully parsed inbound message, payload included.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Greeting {
        version: u32,
        host: String,
        os: String,
        arch: String,
        software_version: String,
    },
    Alive,
    Info {
        key: String,
        value: String,
    },
    Resource {
        name: String,
        total: f64,
        smallest: f64,
        largest: f64,
    },
    ResourceTag {
        tag: String,
    },
    Feature {
        name: String,
    },
    CacheUpdate {
        name: String,
        size: u64,
        transfer_time_usec: u64,
    },
    CacheInvalid {
        name: String,
        reason: String,
    },
    TransferAddress {
        host: String,
        port: u16,
    },
    AvailableResults,
    Result {
        status: i32,
        exit_code: i32,
        output_len: u64,
        exec_usec: u64,
        taskid: u64,
        stdout: Vec<u8>,
    },
    Update {
        taskid: u64,
        path: String,
        offset: u64,
        len: u64,
        data: Vec<u8>,
    },
    End,
    QueueStatus,
    WorkerStatus,
    TaskStatus,
    WableStatus,
    ResourcesStatus,
    Name,
    Auth,
    Http {
        method: String,
        path: String,
        version: String,
    },
}

/// Parse one header line (no trailing `\n`). Strict: an unrecognized
/// leading keyword is [`ProtocolError::UnknownMessage`].
pub fn parse_header_line(line: &str) -> Result<InboundHeader, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(ProtocolError::EmptyLine);
    }

    if line.starts_with("GET ") {
        return parse_http_request_line(line);
    }

    let mut fields = line.split_whitespace();
    let keyword = fields.next().ok_or(ProtocolError::EmptyLine)?;

    let malformed = |kind: &'static str| ProtocolError::Malformed {
        kind,
        line: line.to_string(),
    };

    match keyword {
        "dataswarm" => {
            let version: u32 = fields.next().ok_or_else(|| malformed("dataswarm"))?.parse().map_err(|_| malformed("dataswarm"))?;
            let host = fields.next().ok_or_else(|| malformed("dataswarm"))?.to_string();
            let os = fields.next().ok_or_else(|| malformed("dataswarm"))?.to_string();
            let arch = fields.next().ok_or_else(|| malformed("dataswarm"))?.to_string();
            let software_version = fields.next().unwrap_or("unknown").to_string();
            Ok(InboundHeader::Greeting { version, host, os, arch, software_version })
        }
        "alive" => Ok(InboundHeader::Alive),
        "info" => {
            let key = fields.next().ok_or_else(|| malformed("info"))?.to_string();
            let value = fields.collect::<Vec<_>>().join(" ");
            Ok(InboundHeader::Info { key, value })
        }
        "resource" => {
            let name = fields.next().ok_or_else(|| malformed("resource"))?.to_string();
            if name == "tag" {
                let tag = fields.next().ok_or_else(|| malformed("resource"))?.to_string();
                return Ok(InboundHeader::ResourceTag { tag });
            }
            let total: f64 = fields.next().ok_or_else(|| malformed("resource"))?.parse().map_err(|_| malformed("resource"))?;
            let smallest: f64 = fields.next().ok_or_else(|| malformed("resource"))?.parse().map_err(|_| malformed("resource"))?;
            let largest: f64 = fields.next().ok_or_else(|| malformed("resource"))?.parse().map_err(|_| malformed("resource"))?;
            Ok(InboundHeader::Resource { name, total, smallest, largest })
        }
        "feature" => {
            let name = fields.next().ok_or_else(|| malformed("feature"))?.to_string();
            Ok(InboundHeader::Feature { name })
        }
        "cache-update" => {
            let name = fields.next().ok_or_else(|| malformed("cache-update"))?.to_string();
            let size: u64 = fields.next().ok_or_else(|| malformed("cache-update"))?.parse().map_err(|_| malformed("cache-update"))?;
            let transfer_time_usec: u64 = fields.next().ok_or_else(|| malformed("cache-update"))?.parse().map_err(|_| malformed("cache-update"))?;
            Ok(InboundHeader::CacheUpdate { name, size, transfer_time_usec })
        }
        "cache-invalid" => {
            let name = fields.next().ok_or_else(|| malformed("cache-invalid"))?.to_string();
            let reason_len: u64 = fields.next().ok_or_else(|| malformed("cache-invalid"))?.parse().map_err(|_| malformed("cache-invalid"))?;
            Ok(InboundHeader::CacheInvalidHeader { name, reason_len })
        }
        "transfer-address" => {
            let host = fields.next().ok_or_else(|| malformed("transfer-address"))?.to_string();
            let port: u16 = fields.next().ok_or_else(|| malformed("transfer-address"))?.parse().map_err(|_| malformed("transfer-address"))?;
            Ok(InboundHeader::TransferAddress { host, port })
        }
        "available_results" => Ok(InboundHeader::AvailableResults),
        "result" => {
            let status: i32 = fields.next().ok_or_else(|| malformed("result"))?.parse().map_err(|_| malformed("result"))?;
            let exit_code: i32 = fields.next().ok_or_else(|| malformed("result"))?.parse().map_err(|_| malformed("result"))?;
            let output_len: u64 = fields.next().ok_or_else(|| malformed("result"))?.parse().map_err(|_| malformed("result"))?;
            let exec_usec: u64 = fields.next().ok_or_else(|| malformed("result"))?.parse().map_err(|_| malformed("result"))?;
            let taskid: u64 = fields.next().ok_or_else(|| malformed("result"))?.parse().map_err(|_| malformed("result"))?;
            Ok(InboundHeader::ResultHeader { status, exit_code, output_len, exec_usec, taskid })
        }
        "update" => {
            let taskid: u64 = fields.next().ok_or_else(|| malformed("update"))?.parse().map_err(|_| malformed("update"))?;
            let path = fields.next().ok_or_else(|| malformed("update"))?.to_string();
            let offset: u64 = fields.next().ok_or_else(|| malformed("update"))?.parse().map_err(|_| malformed("update"))?;
            let len: u64 = fields.next().ok_or_else(|| malformed("update"))?.parse().map_err(|_| malformed("update"))?;
            Ok(InboundHeader::UpdateHeader { taskid, path, offset, len })
        }
        "end" => Ok(InboundHeader::End),
        "queue_status" => Ok(InboundHeader::QueueStatus),
        "worker_status" => Ok(InboundHeader::WorkerStatus),
        "task_status" => Ok(InboundHeader::TaskStatus),
        "wable_status" => Ok(InboundHeader::WableStatus),
        "resources_status" => Ok(InboundHeader::ResourcesStatus),
        "name" => Ok(InboundHeader::Name),
        "auth" => Ok(InboundHeader::Auth),
        other => Err(ProtocolError::UnknownMessage(other.to_string())),
    }
}

fn parse_http_request_line(line: &str) -> Result<InboundHeader, ProtocolError> {
    let mut parts = line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts
        .next()
        .ok_or_else(|| ProtocolError::Malformed { kind: "http", line: line.to_string() })?
        .to_string();
    let version = parts.next().unwrap_or("HTTP/1.0").to_string();
    Ok(InboundHeader::Http { method, path, version })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_greeting() {
        let h = parse_header_line("dataswarm 18 myhost Linux x86_64 1.2.3").unwrap();
        assert_eq!(
            h,
            InboundHeader::Greeting {
                version: 18,
                host: "myhost".into(),
                os: "Linux".into(),
                arch: "x86_64".into(),
                software_version: "1.2.3".into(),
            }
        );
    }

    #[test]
    fn parses_resource_tag_variant() {
        let h = parse_header_line("resource tag mytag").unwrap();
        assert_eq!(h, InboundHeader::ResourceTag { tag: "mytag".into() });
    }

    #[test]
    fn parses_resource_vector() {
        let h = parse_header_line("resource cores 4 1 4").unwrap();
        assert_eq!(
            h,
            InboundHeader::Resource { name: "cores".into(), total: 4.0, smallest: 1.0, largest: 4.0 }
        );
    }

    #[test]
    fn result_header_carries_payload_len() {
        let h = parse_header_line("result 0 0 3 1500 42").unwrap();
        assert_eq!(h.payload_len(), 3);
        let msg = h.finish(b"hi\n".to_vec()).unwrap();
        assert_eq!(
            msg,
            InboundMessage::Result {
                status: 0,
                exit_code: 0,
                output_len: 3,
                exec_usec: 1500,
                taskid: 42,
                stdout: b"hi\n".to_vec(),
            }
        );
    }

    #[test]
    fn cache_invalid_carries_reason_payload() {
        let h = parse_header_line("cache-invalid foo.txt 11").unwrap();
        assert_eq!(h.payload_len(), 11);
        let msg = h.finish(b"file-error\n".to_vec()).unwrap();
        assert_eq!(
            msg,
            InboundMessage::CacheInvalid { name: "foo.txt".into(), reason: "file-error\n".into() }
        );
    }

    #[test]
    fn unknown_keyword_is_rejected() {
        let err = parse_header_line("frobnicate 1 2 3").unwrap_err();
        assert_eq!(err, ProtocolError::UnknownMessage("frobnicate".into()));
    }

    #[test]
    fn empty_line_is_rejected() {
        assert_eq!(parse_header_line(""), Err(ProtocolError::EmptyLine));
    }

    #[test]
    fn http_get_is_recognized() {
        let h = parse_header_line("GET /queue_status HTTP/1.1").unwrap();
        assert_eq!(
            h,
            InboundHeader::Http { method: "GET".into(), path: "/queue_status".into(), version: "HTTP/1.1".into() }
        );
    }

    #[test]
    fn malformed_resource_line_is_rejected() {
        let err = parse_header_line("resource cores notanumber").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { kind: "resource", .. }));
    }
}
