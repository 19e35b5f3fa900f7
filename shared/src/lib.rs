use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const CODE_LENGTH: usize = 6;
pub const MAX_USERNAME_LEN: usize = 32;
pub const DEFAULT_ROLE: &str = "Counter-Spy";

/// Failure categories reported to clients in `error.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    SessionNotFound,
    SessionExists,
    SessionInProgress,
    SessionNotInProgress,
    UsernameTaken,
    ParticipantNotFound,
    InvalidUsername,
    NoSessionCode,
    NoUsername,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SessionNotFound => "SessionNotFound",
            ErrorKind::SessionExists => "SessionExists",
            ErrorKind::SessionInProgress => "SessionInProgress",
            ErrorKind::SessionNotInProgress => "SessionNotInProgress",
            ErrorKind::UsernameTaken => "UsernameTaken",
            ErrorKind::ParticipantNotFound => "ParticipantNotFound",
            ErrorKind::InvalidUsername => "InvalidUsername",
            ErrorKind::NoSessionCode => "NoSessionCode",
            ErrorKind::NoUsername => "NoUsername",
            ErrorKind::Other => "Other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound command tags understood by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandTag {
    CreateGame,
    DestroyGame,
    JoinGame,
    LeaveGame,
    StartGame,
    StopGame,
}

impl CommandTag {
    pub const ALL: [CommandTag; 6] = [
        CommandTag::CreateGame,
        CommandTag::DestroyGame,
        CommandTag::JoinGame,
        CommandTag::LeaveGame,
        CommandTag::StartGame,
        CommandTag::StopGame,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandTag::CreateGame => "createGame",
            CommandTag::DestroyGame => "destroyGame",
            CommandTag::JoinGame => "joinGame",
            CommandTag::LeaveGame => "leaveGame",
            CommandTag::StartGame => "startGame",
            CommandTag::StopGame => "stopGame",
        }
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandTag {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandTag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownCommand(s.to_string()))
    }
}

/// Reasons an inbound frame can be rejected before it reaches a handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown command \"{0}\"")]
    UnknownCommand(String),
    #[error("payload for {0} must be an object")]
    InvalidPayload(&'static str),
    #[error("no username was supplied")]
    NoUsername,
    #[error("the username \"{0}\" is invalid")]
    InvalidUsername(String),
    #[error("no game code was supplied")]
    NoSessionCode,
    #[error("game '{0}' was not found. Is the game code correct?")]
    UnknownCode(String),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Malformed(_)
            | ProtocolError::UnknownCommand(_)
            | ProtocolError::InvalidPayload(_) => ErrorKind::Other,
            ProtocolError::NoUsername => ErrorKind::NoUsername,
            ProtocolError::InvalidUsername(_) => ErrorKind::InvalidUsername,
            ProtocolError::NoSessionCode => ErrorKind::NoSessionCode,
            ProtocolError::UnknownCode(_) => ErrorKind::SessionNotFound,
        }
    }
}

/// The `{ "type": ..., "data": ... }` frame shared by both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
struct PlayerPayload {
    username: Option<String>,
    code: Option<String>,
}

/// A validated inbound command, one variant per tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CreateGame { username: String },
    JoinGame { username: String, code: String },
    LeaveGame,
    DestroyGame,
    StartGame,
    StopGame,
}

impl Command {
    pub fn tag(&self) -> CommandTag {
        match self {
            Command::CreateGame { .. } => CommandTag::CreateGame,
            Command::JoinGame { .. } => CommandTag::JoinGame,
            Command::LeaveGame => CommandTag::LeaveGame,
            Command::DestroyGame => CommandTag::DestroyGame,
            Command::StartGame => CommandTag::StartGame,
            Command::StopGame => CommandTag::StopGame,
        }
    }

    /// Validates an envelope into a typed command.
    ///
    /// `data` may be an object or, as older web clients send it, a string
    /// holding a JSON object. Usernames are trimmed; codes are trimmed and
    /// lowercased.
    pub fn decode(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let tag: CommandTag = envelope.kind.parse()?;

        match tag {
            CommandTag::CreateGame => {
                let payload = payload_of(tag, &envelope.data)?;
                Ok(Command::CreateGame {
                    username: validate_username(payload.username)?,
                })
            }
            CommandTag::JoinGame => {
                let payload = payload_of(tag, &envelope.data)?;
                let username = validate_username(payload.username)?;
                let code = normalize_code(payload.code)?;
                Ok(Command::JoinGame { username, code })
            }
            CommandTag::LeaveGame => Ok(Command::LeaveGame),
            CommandTag::DestroyGame => Ok(Command::DestroyGame),
            CommandTag::StartGame => Ok(Command::StartGame),
            CommandTag::StopGame => Ok(Command::StopGame),
        }
    }

    /// Builds the envelope a client sends for this command.
    pub fn to_envelope(&self) -> Envelope {
        let data = match self {
            Command::CreateGame { username } => serde_json::json!({ "username": username }),
            Command::JoinGame { username, code } => {
                serde_json::json!({ "username": username, "code": code })
            }
            _ => serde_json::json!({}),
        };
        Envelope::new(self.tag().as_str(), data)
    }
}

fn payload_of(tag: CommandTag, data: &Value) -> Result<PlayerPayload, ProtocolError> {
    let object = match data {
        Value::Null => return Ok(PlayerPayload::default()),
        Value::String(raw) if raw.trim().is_empty() => return Ok(PlayerPayload::default()),
        Value::String(raw) => serde_json::from_str::<Value>(raw)
            .map_err(|_| ProtocolError::InvalidPayload(tag.as_str()))?,
        other => other.clone(),
    };

    if !object.is_object() {
        return Err(ProtocolError::InvalidPayload(tag.as_str()));
    }

    serde_json::from_value(object).map_err(|_| ProtocolError::InvalidPayload(tag.as_str()))
}

fn validate_username(raw: Option<String>) -> Result<String, ProtocolError> {
    let raw = raw.ok_or(ProtocolError::NoUsername)?;
    let username = raw.trim();

    if username.is_empty()
        || username.chars().count() > MAX_USERNAME_LEN
        || username.chars().any(char::is_control)
    {
        return Err(ProtocolError::InvalidUsername(raw));
    }

    Ok(username.to_string())
}

fn normalize_code(raw: Option<String>) -> Result<String, ProtocolError> {
    let code = raw
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .ok_or(ProtocolError::NoSessionCode)?;

    if !is_valid_code(&code) {
        return Err(ProtocolError::UnknownCode(code));
    }

    Ok(code)
}

/// True for exactly `CODE_LENGTH` lowercase ASCII letters.
pub fn is_valid_code(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.bytes().all(|b| b.is_ascii_lowercase())
}

/// What a player sees about themselves and their game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameView {
    pub code: String,
    pub username: String,
    pub spy: bool,
    pub location: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: ErrorKind,
    pub description: String,
}

/// Reply to a single command, echoing its tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<GameView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn success(kind: impl Into<String>, view: GameView) -> Self {
        Self {
            kind: kind.into(),
            data: Some(view),
            error: None,
        }
    }

    pub fn failure(kind: impl Into<String>, code: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: None,
            error: Some(ResponseError {
                code,
                description: description.into(),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.code)
    }
}

/// Unsolicited updates pushed to the other members of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Notice {
    PlayerJoined { code: String, username: String },
    PlayerLeft { code: String, username: String },
    GameStarted { code: String },
    GameStopped { code: String },
    GameDestroyed { code: String },
}

/// Anything the server writes to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Notice(Notice),
    Response(Response),
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}
