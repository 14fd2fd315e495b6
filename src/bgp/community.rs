use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::slice::Iter;

use serde::Serialize;

/// A standard (RFC 1997) community, displayed as "asn:value"
#[derive(Serialize, Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub struct Community(pub u32);

impl Community {
    pub fn new(asn: u16, value: u16) -> Self {
        Self((u32::from(asn) << 16) + u32::from(value))
    }

    pub fn asn(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn value(&self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl fmt::Display for Community {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.asn(), self.value())
    }
}

impl TryFrom<&str> for Community {
    type Error = io::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let invalid = || io::Error::new(io::ErrorKind::InvalidInput, "Invalid community");
        let chunks: Vec<_> = value.split(':').collect();
        match chunks.len() {
            // A bare u32 (E.g. "4259840100")
            1 => chunks[0].parse().map_err(|_| invalid()).map(Community),
            2 => {
                let asn = chunks[0].parse::<u16>().map_err(|_| invalid())?;
                let value = chunks[1].parse::<u16>().map_err(|_| invalid())?;
                Ok(Community::new(asn, value))
            }
            _ => Err(invalid()),
        }
    }
}

#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct CommunityList(pub Vec<Community>);

impl CommunityList {
    pub fn iter(&self) -> Iter<Community> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, community: Community) -> bool {
        self.0.contains(&community)
    }

    /// Wildcard match against "asn:*" or "*:value" style patterns
    pub fn matches(&self, pattern: &str) -> bool {
        let chunks: Vec<_> = pattern.split(':').collect();
        if chunks.len() != 2 {
            return Community::try_from(pattern)
                .map(|c| self.contains(c))
                .unwrap_or(false);
        }
        self.0.iter().any(|community| {
            let asn_ok = chunks[0] == "*"
                || chunks[0]
                    .parse::<u16>()
                    .map(|asn| asn == community.asn())
                    .unwrap_or(false);
            let value_ok = chunks[1] == "*"
                || chunks[1]
                    .parse::<u16>()
                    .map(|value| value == community.value())
                    .unwrap_or(false);
            asn_ok && value_ok
        })
    }

    pub fn push(&mut self, community: Community) {
        if !self.contains(community) {
            self.0.push(community);
        }
    }

    pub fn remove(&mut self, community: Community) {
        self.0.retain(|c| *c != community);
    }
}

impl fmt::Display for CommunityList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let communities = self
            .0
            .iter()
            .map(std::string::ToString::to_string)
            .collect::<Vec<String>>()
            .join(" ");
        write!(f, "{}", communities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_community_parse_and_display() {
        let community = Community::try_from("65000:100").unwrap();
        assert_eq!(community, Community::new(65000, 100));
        assert_eq!(community.to_string(), "65000:100");

        let bare = Community::try_from("4259840100").unwrap();
        assert_eq!(bare.asn(), 65000);
        assert_eq!(bare.value(), 100);

        assert!(Community::try_from("1:2:3").is_err());
        assert!(Community::try_from("bogus").is_err());
    }

    #[test]
    fn test_community_list_matches() {
        let list = CommunityList(vec![
            Community::new(65000, 100),
            Community::new(65010, 200),
        ]);
        assert!(list.matches("65000:100"));
        assert!(list.matches("65000:*"));
        assert!(list.matches("*:200"));
        assert!(!list.matches("65020:*"));
    }

    #[test]
    fn test_community_list_push_dedup() {
        let mut list = CommunityList::default();
        list.push(Community::new(65000, 100));
        list.push(Community::new(65000, 100));
        assert_eq!(list.0.len(), 1);
        list.remove(Community::new(65000, 100));
        assert!(list.is_empty());
    }
}
