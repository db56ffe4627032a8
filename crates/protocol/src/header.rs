use crate::ProtocolError;

/// The six command-stream message codes from the command protocol.
///
/// Codes 0, 1, 2, 3 and 5 cause the agent to open exactly one data
/// stream in response; the server must `accept_stream()` immediately
/// after writing that header. Code 4 causes the agent to open one
/// control stream plus one data stream per accepted connection. Code 6
/// carries no reply and simply ends the agent's command loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    Execute = 0,
    Download = 1,
    Upload = 2,
    Shell = 3,
    Listen = 4,
    ConnectRemote = 5,
    Shutdown = 6,
}

impl CommandCode {
    pub fn from_u32(v: u32) -> Result<Self, ProtocolError> {
        match v {
            0 => Ok(Self::Execute),
            1 => Ok(Self::Download),
            2 => Ok(Self::Upload),
            3 => Ok(Self::Shell),
            4 => Ok(Self::Listen),
            5 => Ok(Self::ConnectRemote),
            6 => Ok(Self::Shutdown),
            other => Err(ProtocolError::UnknownCommandCode(other)),
        }
    }

    /// True for codes that carry exactly one argument line after the header.
    pub fn has_argument(self) -> bool {
        matches!(
            self,
            Self::Execute | Self::Download | Self::Upload | Self::Listen | Self::ConnectRemote
        )
    }
}

/// A parsed (or to-be-written) command-stream header: a code plus an
/// optional argument line. Argument lines must not themselves contain
/// an LF — the protocol does no escaping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHeader {
    pub code: CommandCode,
    pub argument: Option<String>,
}

impl CommandHeader {
    pub fn execute(command: impl Into<String>) -> Self {
        Self {
            code: CommandCode::Execute,
            argument: Some(command.into()),
        }
    }

    pub fn download(remote_filename: impl Into<String>) -> Self {
        Self {
            code: CommandCode::Download,
            argument: Some(remote_filename.into()),
        }
    }

    pub fn upload(remote_filename: impl Into<String>) -> Self {
        Self {
            code: CommandCode::Upload,
            argument: Some(remote_filename.into()),
        }
    }

    pub fn shell() -> Self {
        Self {
            code: CommandCode::Shell,
            argument: None,
        }
    }

    pub fn listen(remote_bind_addr: impl Into<String>) -> Self {
        Self {
            code: CommandCode::Listen,
            argument: Some(remote_bind_addr.into()),
        }
    }

    pub fn connect_remote(remote_dial_addr: impl Into<String>) -> Self {
        Self {
            code: CommandCode::ConnectRemote,
            argument: Some(remote_dial_addr.into()),
        }
    }

    pub fn shutdown() -> Self {
        Self {
            code: CommandCode::Shutdown,
            argument: None,
        }
    }

    /// Render as the bytes to be written to the command stream.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{}\n", self.code as u32).into_bytes();
        if let Some(arg) = &self.argument {
            out.extend_from_slice(arg.as_bytes());
            out.push(b'\n');
        }
        out
    }

    /// Parse a header from a numeric code line and, if that code takes
    /// one, an already-read argument line.
    pub fn parse(code_line: &str, argument_line: Option<String>) -> Result<Self, ProtocolError> {
        let code_num: u32 = code_line
            .trim()
            .parse()
            .map_err(|_| ProtocolError::UnknownCommandCode(u32::MAX))?;
        let code = CommandCode::from_u32(code_num)?;
        if code.has_argument() && argument_line.is_none() {
            return Err(ProtocolError::MissingArgument(code));
        }
        Ok(Self {
            code,
            argument: argument_line,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_header_encodes_two_lines() {
        let h = CommandHeader::execute("echo hi");
        assert_eq!(h.encode(), b"0\necho hi\n".to_vec());
    }

    #[test]
    fn shell_header_has_no_argument_line() {
        let h = CommandHeader::shell();
        assert_eq!(h.encode(), b"3\n".to_vec());
    }

    #[test]
    fn shutdown_round_trips() {
        let h = CommandHeader::shutdown();
        assert_eq!(h.encode(), b"6\n".to_vec());
        let parsed = CommandHeader::parse("6", None).unwrap();
        assert_eq!(parsed.code, CommandCode::Shutdown);
    }

    #[test]
    fn missing_argument_is_an_error() {
        assert!(CommandHeader::parse("1", None).is_err());
    }

    #[test]
    fn unknown_code_is_an_error() {
        assert!(CommandHeader::parse("99", None).is_err());
    }
}
