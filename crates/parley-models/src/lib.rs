pub mod gateway;
pub mod message;
pub mod room;
pub mod user;

/// Snowflake ids travel as decimal strings on the wire. Plain JSON numbers
/// are accepted on input.
pub mod id_str {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    impl RawId {
        fn into_id<E: de::Error>(self) -> Result<i64, E> {
            match self {
                RawId::Number(n) => Ok(n),
                RawId::Text(s) => s
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| E::custom(format!("invalid id '{s}'"))),
            }
        }
    }

    pub fn serialize<S: Serializer>(id: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        RawId::deserialize(deserializer)?.into_id()
    }

    pub mod option {
        use super::RawId;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(id: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
            match id {
                Some(id) => serializer.collect_str(id),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<i64>, D::Error> {
            Option::<RawId>::deserialize(deserializer)?
                .map(RawId::into_id)
                .transpose()
        }
    }
}
