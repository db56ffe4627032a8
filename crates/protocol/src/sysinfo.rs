use crate::ProtocolError;

/// The first line an agent writes on a freshly opened command stream:
/// `"<os>|<arch>|<hostname>"`. Exactly three pipe-separated fields are
/// required; anything else is a malformed handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub hostname: String,
}

impl SystemInfo {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('|').collect();
        match fields.as_slice() {
            [os, arch, hostname] if !os.is_empty() && !arch.is_empty() && !hostname.is_empty() => {
                Ok(Self {
                    os: os.to_string(),
                    arch: arch.to_string(),
                    hostname: hostname.to_string(),
                })
            }
            _ => Err(ProtocolError::MalformedSystemInfo(line.to_string())),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        format!("{}|{}|{}\n", self.os, self.arch, self.hostname).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_fields() {
        let info = SystemInfo::parse("linux|amd64|alpha").unwrap();
        assert_eq!(info.os, "linux");
        assert_eq!(info.arch, "amd64");
        assert_eq!(info.hostname, "alpha");
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(SystemInfo::parse("linux|amd64").is_err());
        assert!(SystemInfo::parse("linux|amd64|alpha|extra").is_err());
    }

    #[test]
    fn rejects_empty_fields() {
        assert!(SystemInfo::parse("|amd64|alpha").is_err());
    }

    #[test]
    fn encode_round_trips() {
        let info = SystemInfo {
            os: "linux".into(),
            arch: "amd64".into(),
            hostname: "alpha".into(),
        };
        let encoded = info.encode();
        let line = std::str::from_utf8(&encoded).unwrap();
        assert_eq!(SystemInfo::parse(line).unwrap(), info);
    }
}
