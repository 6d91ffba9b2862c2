/// Declares a string newtype with transparent serde and Display.
macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:?}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::convert::Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_string()))
            }
        }
    };
}

string_id! {
    /// Permanent id assigned by the registry, `<familyPrefix><integer>`
    /// (for example `mini1` or `proxy3`). Stable for the lifetime of a
    /// registration.
    ServiceId
}

string_id! {
    /// Random id a service uses between process start and its first
    /// successful registration, `fulcrum-<role>-<uuid>`.
    TempId
}

string_id! {
    /// Id of a connected player, owned by the edge proxy terminating
    /// the connection.
    PlayerId
}

string_id! {
    /// Id of a logical slot, unique per backend (`<serverId>-s<n>`).
    SlotId
}

string_id! {
    /// Named category of slots sharing variant configuration and
    /// capacity limits (for example `skywars`).
    FamilyId
}

string_id! {
    /// A gameplay configuration within a family (for example `duos`).
    VariantId
}

impl ServiceId {
    /// Splits a permanent id into its family prefix and small integer,
    /// e.g. `mini12` into `("mini", 12)`. Returns None for ids that do
    /// not end in digits.
    pub fn split_family(&self) -> Option<(&str, u32)> {
        let digits = self.0.len() - self.0.chars().rev().take_while(|c| c.is_ascii_digit()).count();
        if digits == self.0.len() {
            return None;
        }
        let number = self.0[digits..].parse().ok()?;
        Some((&self.0[..digits], number))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_family_of_permanent_ids() {
        assert_eq!(ServiceId::from("mini12").split_family(), Some(("mini", 12)));
        assert_eq!(ServiceId::from("proxy1").split_family(), Some(("proxy", 1)));
        assert_eq!(ServiceId::from("mini").split_family(), None);
        assert_eq!(ServiceId::from("").split_family(), None);
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = ServiceId::from("mini1");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""mini1""#);
        let back: ServiceId = serde_json::from_str(r#""mini1""#).unwrap();
        assert_eq!(back, id);
    }
}
