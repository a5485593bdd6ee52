//! Chat messages as seen by pipeline stages.

use serde::Serialize;
use serde_json::{json, Value as Json};

use crate::command::Scope;
use crate::script::Environment;

/// What kind of event a message represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// A normal message typed by a user.
    #[default]
    Default,
    /// Join notices, pins and other system events.
    System,
    /// An edit of an earlier message.
    Edit,
    /// A message carrying only embeds.
    EmbedOnly,
}

/// Message author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Author {
    pub id: i64,
    pub name: String,
    pub bot: bool,
}

impl Author {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            bot: false,
        }
    }

    pub fn bot(id: i64, name: impl Into<String>) -> Self {
        Self {
            bot: true,
            ..Self::new(id, name)
        }
    }
}

/// Guild a message was posted in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuildInfo {
    pub id: i64,
    pub name: String,
}

/// A read-only incoming message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: i64,
    pub kind: MessageKind,
    pub content: String,
    pub author: Author,
    /// `None` for direct messages.
    pub guild: Option<GuildInfo>,
    pub channel_id: i64,
}

impl Message {
    /// A normal direct message.
    pub fn new(id: i64, content: impl Into<String>, author: Author) -> Self {
        Self {
            id,
            kind: MessageKind::Default,
            content: content.into(),
            author,
            guild: None,
            channel_id: 0,
        }
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn in_guild(mut self, id: i64, name: impl Into<String>) -> Self {
        self.guild = Some(GuildInfo {
            id,
            name: name.into(),
        });
        self
    }

    pub fn in_channel(mut self, channel_id: i64) -> Self {
        self.channel_id = channel_id;
        self
    }

    /// Guild messages resolve against the guild, direct messages against
    /// the author.
    pub fn scope(&self) -> Scope {
        match &self.guild {
            Some(guild) => Scope::Guild(guild.id),
            None => Scope::User(self.author.id),
        }
    }

    /// Whether custom commands should consider this message at all.
    pub fn is_user_message(&self) -> bool {
        self.kind == MessageKind::Default && !self.author.bot
    }

    /// Bindings a command sees when invoked from this message.
    pub fn to_environment(&self, args: &[&str]) -> Environment {
        let guild = match &self.guild {
            Some(guild) => json!({ "id": guild.id, "name": guild.name }),
            None => Json::Null,
        };

        Environment::new()
            .with(
                "message",
                json!({ "id": self.id, "content": self.content, "args": args }),
            )
            .with(
                "user",
                json!({
                    "id": self.author.id,
                    "name": self.author.name,
                    "bot": self.author.bot,
                }),
            )
            .with("guild", guild)
            .with("channel", json!({ "id": self.channel_id }))
            .with("args", json!(args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope() {
        let dm = Message::new(1, "!ping", Author::new(7, "ada"));
        assert_eq!(dm.scope(), Scope::User(7));

        let guild = dm.clone().in_guild(42, "tea room");
        assert_eq!(guild.scope(), Scope::Guild(42));
    }

    #[test]
    fn test_is_user_message() {
        let message = Message::new(1, "!ping", Author::new(7, "ada"));
        assert!(message.is_user_message());
        assert!(!message.clone().with_kind(MessageKind::Edit).is_user_message());
        assert!(!message.clone().with_kind(MessageKind::System).is_user_message());
        assert!(!Message::new(1, "!ping", Author::bot(8, "bot")).is_user_message());
    }

    #[test]
    fn test_to_environment() {
        let message = Message::new(5, "!roll 2 6", Author::new(7, "ada"))
            .in_guild(42, "tea room")
            .in_channel(9);
        let env = message.to_environment(&["2", "6"]);

        assert_eq!(env.get("args"), Some(&json!(["2", "6"])));
        assert_eq!(env.get("user").unwrap()["name"], json!("ada"));
        assert_eq!(env.get("user").unwrap()["bot"], json!(false));
        assert_eq!(env.get("guild").unwrap()["id"], json!(42));
        assert_eq!(env.get("channel").unwrap()["id"], json!(9));
        assert_eq!(env.get("message").unwrap()["content"], json!("!roll 2 6"));
    }

    #[test]
    fn test_to_environment_direct_message() {
        let env = Message::new(5, "!roll", Author::new(7, "ada")).to_environment(&[]);
        assert_eq!(env.get("guild"), Some(&Json::Null));
        assert_eq!(env.get("args"), Some(&json!([])));
    }
}
