//! A Twitch game/category, as referenced by campaigns, drops and channels.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// A game on Twitch. Equality and hashing are by `id` alone, mirroring the
/// original `Game.__eq__`/`__hash__` (two `Game`s with the same id but
/// different display data are the same game).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    #[serde(alias = "displayName", alias = "name", default)]
    pub name: String,
    #[serde(rename = "boxArtURL", default)]
    pub box_art_url: Option<String>,
}

impl PartialEq for Game {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Game {}

impl std::hash::Hash for Game {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

fn apostrophe_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"'").unwrap())
}

fn non_word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\W+").unwrap())
}

fn multi_dash_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-{2,}").unwrap())
}

impl Game {
    /// Parse a `game` object as embedded in campaign/stream GQL responses:
    /// `{"id", "displayName" or "name", "boxArtURL"}`.
    pub fn from_gql(data: &serde_json::Value) -> Option<Self> {
        let id = data.get("id")?.as_str()?.to_string();
        let name = data
            .get("displayName")
            .or_else(|| data.get("name"))
            .and_then(|v| v.as_str())?
            .to_string();
        let box_art_url = data.get("boxArtURL").and_then(|v| v.as_str()).map(str::to_string);
        Some(Self { id, name, box_art_url })
    }

    /// Directory/redirect slug for this game's name. Verbatim port of
    /// `Game.slug`: lowercase, strip apostrophes, collapse non-word runs to a
    /// single dash, trim leading/trailing dashes, then collapse any
    /// remaining multi-dash runs (the strip happens before the final
    /// collapse, same order as the source).
    pub fn slug(&self) -> String {
        let lowered = self.name.to_lowercase();
        let no_apostrophes = apostrophe_re().replace_all(&lowered, "");
        let dashed = non_word_re().replace_all(&no_apostrophes, "-");
        let trimmed = dashed.trim_matches('-');
        multi_dash_re().replace_all(trimmed, "-").into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game(name: &str) -> Game {
        Game {
            id: "1".into(),
            name: name.into(),
            box_art_url: None,
        }
    }

    #[test]
    fn slug_strips_apostrophes_and_collapses_punctuation() {
        assert_eq!(game(" Foo's  Bar! ").slug(), "foo-s-bar");
    }

    #[test]
    fn slug_handles_plain_names() {
        assert_eq!(game("Fortnite").slug(), "fortnite");
    }

    #[test]
    fn slug_collapses_leading_and_trailing_punctuation() {
        assert_eq!(game("--Foo--").slug(), "foo");
    }

    #[test]
    fn games_are_equal_by_id_only() {
        let a = Game { id: "1".into(), name: "A".into(), box_art_url: None };
        let b = Game { id: "1".into(), name: "B".into(), box_art_url: None };
        assert_eq!(a, b);
    }
}
