use serde::{de, Deserialize};
use url::Url;

// Custom deserialisers for the announce fields of the metainfo.

pub fn url_deserialize<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: de::Deserializer<'de>,
{
    Url::parse(&String::deserialize(deserializer)?).map_err(de::Error::custom)
}

// Tiers of tracker urls. Some torrents carry an announce-list key with no
// urls in it at all; that counts as absent.
pub fn announce_list_deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<Vec<Url>>>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let tiers = Vec::<Vec<String>>::deserialize(deserializer)?
        .into_iter()
        .map(|tier| {
            tier.iter()
                .map(|url| Url::parse(url).map_err(de::Error::custom))
                .collect()
        })
        .collect::<Result<Vec<Vec<Url>>, _>>()?;

    if tiers.iter().all(|tier| tier.is_empty()) {
        Ok(None)
    } else {
        Ok(Some(tiers))
    }
}
