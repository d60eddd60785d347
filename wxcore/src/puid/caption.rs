use crate::types::contact::RawContact;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Descriptive attributes used for fuzzy identity matching when no exact
/// key matches. Absent fields act as wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Caption {
    pub nick: Option<String>,
    pub sex: Option<u8>,
    pub province: Option<String>,
    pub city: Option<String>,
}

fn present(s: &str) -> Option<String> {
    if s.is_empty() { None } else { Some(s.to_string()) }
}

impl Caption {
    pub fn new(nick: &str, sex: u8, province: &str, city: &str) -> Self {
        Self {
            nick: present(nick),
            sex: if sex == 0 { None } else { Some(sex) },
            province: present(province),
            city: present(city),
        }
    }

    pub fn from_contact(contact: &RawContact) -> Self {
        Self::new(
            &contact.nick_name,
            contact.sex,
            &contact.province,
            &contact.city,
        )
    }

    /// Whether `observed` may describe the same chat as `self`.
    ///
    /// The observed side must carry a nick; every field present on both
    /// sides must be equal.
    pub fn is_compatible(&self, observed: &Caption) -> bool {
        if observed.nick.is_none() {
            return false;
        }
        fn agree<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }
        agree(&self.nick, &observed.nick)
            && agree(&self.sex, &observed.sex)
            && agree(&self.province, &observed.province)
            && agree(&self.city, &observed.city)
    }

    /// Field-wise merge where `newer` wins wherever it has a value.
    pub fn merged_with(&self, newer: &Caption) -> Caption {
        Caption {
            nick: newer.nick.clone().or_else(|| self.nick.clone()),
            sex: newer.sex.or(self.sex),
            province: newer.province.clone().or_else(|| self.province.clone()),
            city: newer.city.clone().or_else(|| self.city.clone()),
        }
    }
}

impl fmt::Display for Caption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "({}, {}, {}, {})",
            s(&self.nick),
            self.sex.map(|x| x.to_string()).unwrap_or_else(|| "-".into()),
            s(&self.province),
            s(&self.city)
        )
    }
}
