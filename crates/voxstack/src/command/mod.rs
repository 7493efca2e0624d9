//! XML command server
//!
//! Operators and companion applications drive a running stack over a TCP
//! connection carrying tag-delimited XML (see [`xml`]). Built-in commands
//! query and tune the stack; `ClickToCall` and `InitialSync` are handed to an
//! application-supplied [`CommandHandler`].

mod server;
pub mod xml;

pub use server::CommandServer;
pub use xml::XmlRequest;

use std::str::FromStr;

use voxstack_sip_transport::MetricType;

use crate::stack::StackHandle;

/// Outcome of one command, rendered into the `Result` and `Data` elements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub code: u16,
    pub text: String,
    pub data: String,
}

impl CommandResponse {
    pub fn ok(text: impl Into<String>) -> Self {
        CommandResponse {
            code: 200,
            text: text.into(),
            data: String::new(),
        }
    }

    pub fn error(code: u16, text: impl Into<String>) -> Self {
        CommandResponse {
            code,
            text: text.into(),
            data: String::new(),
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }
}

/// Application commands the stack does not implement itself
pub trait CommandHandler: Send + Sync {
    fn click_to_call(&self, request: &XmlRequest, stack: &StackHandle) -> CommandResponse;

    fn initial_sync(&self, request: &XmlRequest, stack: &StackHandle) -> CommandResponse;
}

/// Commands understood by [`CommandServer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    GetStackInfo,
    GetCongestionStats,
    SetCongestionTolerance {
        fifo: String,
        metric: MetricType,
        max_tolerance: u64,
    },
    Shutdown,
    ClickToCall,
    InitialSync,
}

impl Command {
    /// Maps a request to a command, or to the 400 response it deserves
    pub fn parse(request: &XmlRequest) -> Result<Command, CommandResponse> {
        let tag = request.tag.to_ascii_lowercase();
        match tag.as_str() {
            "getstackinfo" => Ok(Command::GetStackInfo),
            "getcongestionstats" => Ok(Command::GetCongestionStats),
            "setcongestiontolerance" => parse_tolerance(request),
            "shutdown" => Ok(Command::Shutdown),
            "clicktocall" => Ok(Command::ClickToCall),
            "initialsync" => Ok(Command::InitialSync),
            _ => Err(CommandResponse::error(400, "Unknown method")),
        }
    }
}

fn parse_tolerance(request: &XmlRequest) -> Result<Command, CommandResponse> {
    let fifo = request
        .child("fifoDescription")
        .filter(|f| !f.is_empty())
        .ok_or_else(|| CommandResponse::error(400, "Invalid fifo description provided."))?;
    let metric = request
        .child("metric")
        .and_then(|m| MetricType::from_str(&m).ok())
        .ok_or_else(|| {
            CommandResponse::error(
                400,
                "Invalid metric specified: must be SIZE, TIME_DEPTH or WAIT_TIME.",
            )
        })?;
    let max_tolerance = request
        .child("maxtolerance")
        .and_then(|m| m.parse::<u64>().ok())
        .filter(|m| *m > 0)
        .ok_or_else(|| {
            CommandResponse::error(400, "Invalid MaxTolerance specified: must be greater than 0.")
        })?;
    Ok(Command::SetCongestionTolerance {
        fifo,
        metric,
        max_tolerance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(tag: &str, body: &str) -> XmlRequest {
        XmlRequest {
            tag: tag.to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse(&request("GETSTACKINFO", "")), Ok(Command::GetStackInfo));
        assert_eq!(Command::parse(&request("ClickToCall", "")), Ok(Command::ClickToCall));
        assert_eq!(Command::parse(&request("Restart", "")).unwrap_err().code, 400);
    }

    #[test]
    fn test_parse_tolerance() {
        let ok = request(
            "SetCongestionTolerance",
            "<fifoDescription>state machine</fifoDescription><metric>wait_time</metric><maxtolerance>50</maxtolerance>",
        );
        assert_eq!(
            Command::parse(&ok),
            Ok(Command::SetCongestionTolerance {
                fifo: "state machine".to_string(),
                metric: MetricType::WaitTime,
                max_tolerance: 50,
            })
        );

        let bad_metric = request(
            "SetCongestionTolerance",
            "<fifoDescription>x</fifoDescription><metric>LOUDNESS</metric><maxtolerance>5</maxtolerance>",
        );
        assert!(Command::parse(&bad_metric).unwrap_err().text.starts_with("Invalid metric"));

        let zero = request(
            "SetCongestionTolerance",
            "<fifoDescription>x</fifoDescription><metric>SIZE</metric><maxtolerance>0</maxtolerance>",
        );
        assert!(Command::parse(&zero).unwrap_err().text.starts_with("Invalid MaxTolerance"));

        let no_fifo = request("SetCongestionTolerance", "<metric>SIZE</metric>");
        assert!(Command::parse(&no_fifo).unwrap_err().text.starts_with("Invalid fifo"));
    }
}
