#![forbid(unsafe_code)]

// Lobby protocol - command types exchanged with the lobby server

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Literal keep-alive probe sent by the server.
pub const KEEPALIVE_PROBE: &str = "PING";
/// Literal keep-alive reply expected by the server.
pub const KEEPALIVE_REPLY: &str = "PONG";

pub const PROTOCOL_VERSION: &str = "1.0.0";
pub const USER_AGENT: &str = "loadtest";
pub const LOCAL_IP: &str = "127.0.0.1";

/// Opaque client identifier blob sent with the login request. The server
/// only checks that one is present; this one is a fixed, well-formed sample.
pub const UNIQUE_ID: &str = "AnpaNjFpTERCV2pPQ2lidzY5UkNWZnc9PTZaNlVQMFFrc01iTWNtdEh5akE3NFdpUFVrSkVKWVV3UUV6SWc5ZGppRzhRNFEwNDRYTS93Sk40MFZxUkM5ZVdmM2xXVTVSTnlXZWMyd1lvUjQwUkpacE1qN21CN3l2citYbGNBRmhxVklnRHhtclMzMkF0bkhZYWF1emlUSFk5Zkw1WnNaaDBWWDFJcEY3L0lGa2lLUVd4V0xFVExoN0JUbVgzMUFTdWlUM1BBMS8rdkducnlDenQ3UFVNa2hVSnI1WVlBNTdMcllMZTZkd2E2K1BCcjNZWkRYblR1ZUNKdzY2d1M5U2p1MDBRTGV1Um1PdVBuNW1Uc1hpZyswcGtlemlDcEFFY1VacEkwK0Z0d094aFFUalFLUzNGaFNtQ1V5TVRkb29kY0dJZVU4VUkzWnFTS3JyU0FFeTNQNEFCYnNpOHRxNEFHMnN3UU5VczRielVtQ3VsMGVmelhYU1RyaE9haExMay91Q1g5bzhFb0Q5RzN0aUptbW9iQWE0M25US01EODd0VFlvenF4UlRoblVoSjBPQTlPYTYrbkxHbm43MXdoWUtYbWdJR2JadmYrOWVucTJHMU1vQVZwWFpkd0ZHNmlRYldlQ3ZQYlE3ZW1WVE82cVJHSVhEUHkzNGtBUkZqVXMrVjRBdzY4QUtDZXQ3RUYxMWc5eUY3MmVON1ZnTGtEa1N0dllkQkJxMTQxV0VXYUh4QXYwdDIvSVBoVmNnVWZFSkpJMktObnBldEQyaUYweW9qTnFLa05weFMwYkFmR0dhdjhpdHNoZ2VKckFKVlQzL0N4YWJmUFEzNGNRVkNMMU1tQnVNOUN4TGpZeEZpa3hlOGZKK3Y0MmRtU1ozY3JGUlhjMFFWaTFEM3l4VHpkenNXYU9XSFpYeGpQQ0F2ekN3RVpFdzB0NjFZZSt5dG5hd0JVR2dQdHFkYnk2S3RNeUwraEt0WUN3Snk3SkRIbTRSNDFnN01JVWN5WVVxVUExcW51MExrVXF3c0c2NEUxQmo0RVM1SGxwNjh5aVhvNnp6OTlzNUViNTVseVlDUUZOakRGUTBWalBZSlVpQkVpUFlCeElvcWo4eHdxcVUyWXJQQjA3dGJEd1hDbjYzdnZtSEYwTWV2a2hXdnhDMGNLUjZRZEJ2bVpPRisvZHc5anV6QTlvc2JnUFVtdzZCaTdvRHZjOW5RQ3I4YXNpLzF2QWVTdzU4ajFOUlJuOEFLSmNTcldwby9uWTZiVy9HU1NpWWkrSnl0T0tlU2UwMUhMYTh1Nm5KeG5aYkc1MkMzbDg1NFdCR3h4QnplbUc5UXc9PUI2dkdwMm5IRlIrQlpNRE1oaWhsV1BmQzVlQlhDU0RBYWNRQk93PT0";

/// Routing discriminator carried by in-game commands. Messages without a
/// `target` field are client-scoped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    #[default]
    Client,
    Game,
}

/// Commands this client sends to the lobby server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command")]
pub enum ClientCommand {
    #[serde(rename = "ask_session")]
    AskSession { version: String, user_agent: String },

    #[serde(rename = "hello")]
    Hello {
        login: String,
        password: String,
        user_agent: String,
        version: String,
        unique_id: String,
        local_ip: String,
    },

    #[serde(rename = "game_host")]
    GameHost {
        mapname: String,
        title: String,
        #[serde(rename = "mod")]
        mod_name: String,
        options: Vec<bool>,
        access: String,
        visibility: String,
    },

    #[serde(rename = "GameState")]
    GameState { target: Target, args: Vec<Value> },

    #[serde(rename = "GameOption")]
    GameOption { target: Target, args: Vec<Value> },

    #[serde(rename = "PlayerOption")]
    PlayerOption { target: Target, args: Vec<Value> },

    #[serde(rename = "ClearSlot")]
    ClearSlot { target: Target, args: Vec<Value> },

    #[serde(rename = "GameResult")]
    GameResult { target: Target, args: Vec<Value> },

    #[serde(rename = "JsonStats")]
    JsonStats { target: Target, args: Vec<Value> },
}

impl ClientCommand {
    pub fn ask_session() -> Self {
        Self::AskSession {
            version: PROTOCOL_VERSION.to_string(),
            user_agent: USER_AGENT.to_string(),
        }
    }

    pub fn hello(login: String, password_hash: String) -> Self {
        Self::Hello {
            login,
            password: password_hash,
            user_agent: USER_AGENT.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            unique_id: UNIQUE_ID.to_string(),
            local_ip: LOCAL_IP.to_string(),
        }
    }

    pub fn game_host(title: String) -> Self {
        Self::GameHost {
            mapname: "12 The Pass".to_string(),
            title,
            mod_name: "faf".to_string(),
            options: Vec::new(),
            access: "public".to_string(),
            visibility: "public".to_string(),
        }
    }

    pub fn game_state(state: &str) -> Self {
        Self::GameState {
            target: Target::Game,
            args: vec![state.into()],
        }
    }

    pub fn game_option(option: &str, value: impl Into<Value>) -> Self {
        Self::GameOption {
            target: Target::Game,
            args: vec![option.into(), value.into()],
        }
    }

    /// The player id travels as a string, the option value as-is.
    pub fn player_option(player_id: u32, option: &str, value: impl Into<Value>) -> Self {
        Self::PlayerOption {
            target: Target::Game,
            args: vec![player_id.to_string().into(), option.into(), value.into()],
        }
    }

    pub fn clear_slot(slot_id: u32) -> Self {
        Self::ClearSlot {
            target: Target::Game,
            args: vec![slot_id.into()],
        }
    }

    pub fn game_result(player_id: u32, result: &str) -> Self {
        Self::GameResult {
            target: Target::Game,
            args: vec![player_id.into(), result.into()],
        }
    }

    pub fn json_stats(stats: &str) -> Self {
        Self::JsonStats {
            target: Target::Game,
            args: vec![stats.into()],
        }
    }
}

/// Server commands this client recognizes. Payload fields are ignored —
/// only the command name drives the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ServerCommand {
    Session,
    Social,
    Welcome,
    AuthenticationFailed,
    ModInfo,
    Notice,
    GameLaunch,
    PlayerInfo,
    GameInfo,
}

/// A parsed inbound message. `body` is `None` for command names outside the
/// recognized set; those are counted, logged, and dropped by the caller.
#[derive(Debug)]
pub struct InboundMessage {
    pub command: String,
    pub target: Target,
    pub body: Option<ServerCommand>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    command: String,
    #[serde(default)]
    target: Target,
}

/// Parse a raw inbound payload. Fails only on malformed JSON or a missing
/// `command` field; unrecognized command names parse into `body: None`.
pub fn parse_inbound(raw: &str) -> Result<InboundMessage, serde_json::Error> {
    let value: Value = serde_json::from_str(raw)?;
    let envelope: Envelope = serde_json::from_value(value.clone())?;
    let body = serde_json::from_value::<ServerCommand>(value).ok();
    Ok(InboundMessage {
        command: envelope.command,
        target: envelope.target,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_commands_carry_the_command_tag() {
        let json = serde_json::to_value(ClientCommand::ask_session()).unwrap();
        assert_eq!(json["command"], "ask_session");
        assert_eq!(json["version"], PROTOCOL_VERSION);
        assert_eq!(json["user_agent"], USER_AGENT);
    }

    #[test]
    fn game_host_renames_mod() {
        let json = serde_json::to_value(ClientCommand::game_host("Test Game 7".into())).unwrap();
        assert_eq!(json["command"], "game_host");
        assert_eq!(json["mod"], "faf");
        assert_eq!(json["mapname"], "12 The Pass");
        assert!(json.get("mod_name").is_none());
    }

    #[test]
    fn game_commands_target_game_scope() {
        let json = serde_json::to_value(ClientCommand::game_state("Lobby")).unwrap();
        assert_eq!(json["command"], "GameState");
        assert_eq!(json["target"], "game");
        assert_eq!(json["args"], serde_json::json!(["Lobby"]));

        let json = serde_json::to_value(ClientCommand::player_option(3, "Faction", 1)).unwrap();
        assert_eq!(json["args"], serde_json::json!(["3", "Faction", 1]));

        let json = serde_json::to_value(ClientCommand::game_result(5, "score 10")).unwrap();
        assert_eq!(json["args"], serde_json::json!([5, "score 10"]));
    }

    #[test]
    fn parses_recognized_inbound_command() {
        let msg = parse_inbound(r#"{"command":"welcome","id":42,"login":"User 42"}"#).unwrap();
        assert_eq!(msg.command, "welcome");
        assert_eq!(msg.target, Target::Client);
        assert_eq!(msg.body, Some(ServerCommand::Welcome));
    }

    #[test]
    fn missing_target_defaults_to_client() {
        let msg = parse_inbound(r#"{"command":"session","session":"abc"}"#).unwrap();
        assert_eq!(msg.target, Target::Client);
        assert_eq!(msg.body, Some(ServerCommand::Session));
    }

    #[test]
    fn game_target_is_accepted() {
        let msg = parse_inbound(r#"{"command":"game_info","target":"game"}"#).unwrap();
        assert_eq!(msg.target, Target::Game);
    }

    #[test]
    fn unrecognized_command_keeps_its_name() {
        let msg = parse_inbound(r#"{"command":"matchmaker_info","queues":[]}"#).unwrap();
        assert_eq!(msg.command, "matchmaker_info");
        assert!(msg.body.is_none());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_inbound("not json").is_err());
        assert!(parse_inbound(r#"{"no_command":true}"#).is_err());
    }
}
