use foldershop_core::{StorefrontClient, StorefrontError};
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    Username,
    IdPattern,
    FolderMeta,
}

impl MatchRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchRule::Username => "username",
            MatchRule::IdPattern => "id pattern",
            MatchRule::FolderMeta => "folder meta",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerMatch {
    pub owner_id: u64,
    pub rule: MatchRule,
}

/// Maps a top-level folder name to a storefront user. Rules are tried in
/// order and the first hit wins.
pub struct OwnerResolver {
    client: StorefrontClient,
    id_pattern: Regex,
}

impl OwnerResolver {
    pub fn new(client: StorefrontClient) -> Result<Self, regex::Error> {
        Ok(Self {
            client,
            id_pattern: user_id_pattern()?,
        })
    }

    pub async fn resolve(&self, folder: &str) -> Result<Option<OwnerMatch>, StorefrontError> {
        if let Some(user) = self.client.find_user_by_login(folder).await? {
            return Ok(Some(OwnerMatch {
                owner_id: user.id,
                rule: MatchRule::Username,
            }));
        }

        if let Some(id) = parse_user_id(&self.id_pattern, folder) {
            if let Some(user) = self.client.get_user(id).await? {
                return Ok(Some(OwnerMatch {
                    owner_id: user.id,
                    rule: MatchRule::IdPattern,
                }));
            }
        }

        Ok(self
            .client
            .find_user_by_folder_meta(folder)
            .await?
            .map(|user| OwnerMatch {
                owner_id: user.id,
                rule: MatchRule::FolderMeta,
            }))
    }
}

fn user_id_pattern() -> Result<Regex, regex::Error> {
    Regex::new(r"(?i)user[_-](\d+)")
}

fn parse_user_id(pattern: &Regex, folder: &str) -> Option<u64> {
    pattern
        .captures(folder)
        .and_then(|caps| caps.get(1))
        .and_then(|id| id.as_str().parse().ok())
}
