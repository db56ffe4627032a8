/// The four request shapes the listener/dispatcher recognises on a
/// freshly accepted TLS connection, plus the catch-all.
///
/// Matching is case-sensitive and space-separated, HTTP/1.1
/// request-line syntax. `<magic>` gates every HTTP route; without it
/// every GET/POST falls through to `NotFound`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// `CONNECT <anything> HTTP/1.1` — upgrade to an agent session.
    NewAgentSession,
    /// `GET /<magic>/agent/<os>/<arch> ...` — agent binary download.
    AgentBuild { os: String, arch: String },
    /// `GET /<magic>/<path> ...` — serve a file from the share root.
    FileDownload { path: String },
    /// `POST /<magic>/<path> ...` — write a file into the share root.
    FileUpload { path: String },
    /// Anything else: `404 Not Found`.
    NotFound,
}

pub struct HttpRequestLine;

impl HttpRequestLine {
    /// Parse the first request line against the server's magic prefix.
    /// Never fails: an unrecognised line is `RequestKind::NotFound`,
    /// matching spec's "otherwise -> 404" fallthrough.
    pub fn parse(line: &str, magic: &str) -> RequestKind {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.split(' ');
        let (Some(method), Some(target), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return RequestKind::NotFound;
        };
        if !version.starts_with("HTTP/1.1") {
            return RequestKind::NotFound;
        }

        match method {
            "CONNECT" => RequestKind::NewAgentSession,
            "GET" => {
                let agent_prefix = format!("/{magic}/agent/");
                if let Some(rest) = target.strip_prefix(&agent_prefix) {
                    if let Some((os, arch)) = rest.split_once('/') {
                        if !os.is_empty() && !arch.is_empty() && !arch.contains('/') {
                            return RequestKind::AgentBuild {
                                os: os.to_string(),
                                arch: arch.to_string(),
                            };
                        }
                    }
                    return RequestKind::NotFound;
                }
                let share_prefix = format!("/{magic}/");
                match target.strip_prefix(&share_prefix) {
                    Some(path) if !path.is_empty() => RequestKind::FileDownload {
                        path: path.to_string(),
                    },
                    _ => RequestKind::NotFound,
                }
            }
            "POST" => {
                let share_prefix = format!("/{magic}/");
                match target.strip_prefix(&share_prefix) {
                    Some(path) if !path.is_empty() => RequestKind::FileUpload {
                        path: path.to_string(),
                    },
                    _ => RequestKind::NotFound,
                }
            }
            _ => RequestKind::NotFound,
        }
    }
}
