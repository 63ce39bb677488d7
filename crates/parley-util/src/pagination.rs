use serde::{Deserialize, Serialize, Serializer};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Keyset cursor for message history. `before` is the id of the oldest
/// message already seen; pages walk backwards from it (exclusive), so rows
/// inserted meanwhile never shift a page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CursorParams {
    pub before: Option<i64>,
    pub limit: Option<u32>,
}

impl CursorParams {
    pub fn limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorResponse<T: Serialize> {
    pub items: Vec<T>,
    pub has_more: bool,
    /// Pass back as `before` to fetch the next (older) page.
    #[serde(serialize_with = "id_as_string")]
    pub next_before: Option<i64>,
}

fn id_as_string<S: Serializer>(id: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
    match id {
        Some(id) => serializer.collect_str(id),
        None => serializer.serialize_none(),
    }
}
