use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::abi::{AbiError, ParamType, Token};
use crate::error::DashboardError;
use crate::units::format_units;

/// A 20-byte account or contract address.
///
/// Equality is byte-wise, so comparisons ignore the letter case of the
/// textual form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Address::ZERO
    }
}

impl FromStr for Address {
    type Err = DashboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if digits.len() != 40 {
            return Err(DashboardError::Validation(format!("Invalid address: {}", s)));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|_| DashboardError::Validation(format!("Invalid address: {}", s)))?;
        Ok(Address(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

/// Place of a property in the registry's approval and sale workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyStatus {
    Pending = 0,
    Approved = 1,
    Rejected = 2,
    ListedForSale = 3,
    PurchasePending = 4,
    Sold = 5,
}

impl PropertyStatus {
    pub fn label(self) -> &'static str {
        match self {
            PropertyStatus::Pending => "Pending",
            PropertyStatus::Approved => "Approved",
            PropertyStatus::Rejected => "Rejected",
            PropertyStatus::ListedForSale => "Listed For Sale",
            PropertyStatus::PurchasePending => "Purchase Pending",
            PropertyStatus::Sold => "Sold",
        }
    }
}

impl TryFrom<u128> for PropertyStatus {
    type Error = AbiError;

    fn try_from(code: u128) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => PropertyStatus::Pending,
            1 => PropertyStatus::Approved,
            2 => PropertyStatus::Rejected,
            3 => PropertyStatus::ListedForSale,
            4 => PropertyStatus::PurchasePending,
            5 => PropertyStatus::Sold,
            other => {
                return Err(AbiError::UnexpectedToken {
                    expected: "property status 0-5",
                    found: other.to_string(),
                })
            }
        })
    }
}

impl FromStr for PropertyStatus {
    type Err = DashboardError;

    /// Accepts the numeric code or the snake_case name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(code) = s.parse::<u128>() {
            return PropertyStatus::try_from(code)
                .map_err(|_| DashboardError::Validation(format!("Unknown status: {}", s)));
        }
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(PropertyStatus::Pending),
            "approved" => Ok(PropertyStatus::Approved),
            "rejected" => Ok(PropertyStatus::Rejected),
            "listed_for_sale" => Ok(PropertyStatus::ListedForSale),
            "purchase_pending" => Ok(PropertyStatus::PurchasePending),
            "sold" => Ok(PropertyStatus::Sold),
            _ => Err(DashboardError::Validation(format!("Unknown status: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending = 0,
    Approved = 1,
    Rejected = 2,
}

impl TryFrom<u128> for TransactionStatus {
    type Error = AbiError;

    fn try_from(code: u128) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => TransactionStatus::Pending,
            1 => TransactionStatus::Approved,
            2 => TransactionStatus::Rejected,
            other => {
                return Err(AbiError::UnexpectedToken {
                    expected: "transaction status 0-2",
                    found: other.to_string(),
                })
            }
        })
    }
}

/// A registry property as last read from the contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub id: u64,
    pub state: String,
    pub district: String,
    pub village: String,
    pub survey_number: String,
    pub owner: Address,
    #[serde(with = "crate::units::base_units")]
    pub market_value: u128,
    pub reference_id: String,
    pub document_hash: Option<String>,
    pub status: PropertyStatus,
    pub registered_at: u64,
    pub last_updated: u64,
    pub is_active: bool,
}

impl Property {
    /// Return shape of `getProperty(uint256)`.
    pub fn schema() -> ParamType {
        ParamType::Tuple(vec![
            ParamType::Uint,    // id
            ParamType::String,  // state
            ParamType::String,  // district
            ParamType::String,  // village
            ParamType::String,  // survey number
            ParamType::Address, // owner
            ParamType::Uint,    // market value
            ParamType::String,  // reference id
            ParamType::String,  // document hash
            ParamType::Uint,    // status
            ParamType::Uint,    // registered at
            ParamType::Uint,    // last updated
            ParamType::Bool,    // active
        ])
    }

    pub fn from_token(token: Token) -> Result<Self, AbiError> {
        let mut fields = token.into_tuple()?.into_iter();
        let mut next = || {
            fields.next().ok_or(AbiError::UnexpectedToken {
                expected: "13 property fields",
                found: "fewer".into(),
            })
        };
        Ok(Property {
            id: next()?.into_u64()?,
            state: next()?.into_string()?,
            district: next()?.into_string()?,
            village: next()?.into_string()?,
            survey_number: next()?.into_string()?,
            owner: next()?.into_address()?,
            market_value: next()?.into_uint()?,
            reference_id: next()?.into_string()?,
            document_hash: non_empty(next()?.into_string()?),
            status: PropertyStatus::try_from(next()?.into_uint()?)?,
            registered_at: next()?.into_u64()?,
            last_updated: next()?.into_u64()?,
            is_active: next()?.into_bool()?,
        })
    }

    /// Encodes the record in the `getProperty` return shape.
    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Uint(u128::from(self.id)),
            Token::String(self.state.clone()),
            Token::String(self.district.clone()),
            Token::String(self.village.clone()),
            Token::String(self.survey_number.clone()),
            Token::Address(self.owner),
            Token::Uint(self.market_value),
            Token::String(self.reference_id.clone()),
            Token::String(self.document_hash.clone().unwrap_or_default()),
            Token::Uint(self.status as u128),
            Token::Uint(u128::from(self.registered_at)),
            Token::Uint(u128::from(self.last_updated)),
            Token::Bool(self.is_active),
        ])
    }

    pub fn is_owned_by(&self, account: &Address) -> bool {
        self.owner == *account
    }

    /// Whether `account` may request to buy this property.
    pub fn is_available_for(&self, account: &Address) -> bool {
        self.is_active && self.status == PropertyStatus::ListedForSale && !self.is_owned_by(account)
    }

    pub fn market_value_display(&self) -> String {
        format_units(self.market_value)
    }

    /// Registration date as `MMM dd, yyyy` in UTC.
    pub fn registered_on(&self) -> String {
        i64::try_from(self.registered_at)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|at| at.format("%b %d, %Y").to_string())
            .unwrap_or_default()
    }
}

/// A purchase request recorded against a property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: u64,
    pub property_id: u64,
    pub seller: Address,
    pub buyer: Address,
    #[serde(with = "crate::units::base_units")]
    pub price: u128,
    pub status: TransactionStatus,
    pub requested_at: u64,
    pub completed_at: u64,
    pub document_hash: Option<String>,
}

impl Transaction {
    /// Return shape of `getTransaction(uint256)`.
    pub fn schema() -> ParamType {
        ParamType::Tuple(vec![
            ParamType::Uint,
            ParamType::Uint,
            ParamType::Address,
            ParamType::Address,
            ParamType::Uint,
            ParamType::Uint,
            ParamType::Uint,
            ParamType::Uint,
            ParamType::String,
        ])
    }

    pub fn from_token(token: Token) -> Result<Self, AbiError> {
        let mut fields = token.into_tuple()?.into_iter();
        let mut next = || {
            fields.next().ok_or(AbiError::UnexpectedToken {
                expected: "9 transaction fields",
                found: "fewer".into(),
            })
        };
        Ok(Transaction {
            id: next()?.into_u64()?,
            property_id: next()?.into_u64()?,
            seller: next()?.into_address()?,
            buyer: next()?.into_address()?,
            price: next()?.into_uint()?,
            status: TransactionStatus::try_from(next()?.into_uint()?)?,
            requested_at: next()?.into_u64()?,
            completed_at: next()?.into_u64()?,
            document_hash: non_empty(next()?.into_string()?),
        })
    }

    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Uint(u128::from(self.id)),
            Token::Uint(u128::from(self.property_id)),
            Token::Address(self.seller),
            Token::Address(self.buyer),
            Token::Uint(self.price),
            Token::Uint(self.status as u128),
            Token::Uint(u128::from(self.requested_at)),
            Token::Uint(u128::from(self.completed_at)),
            Token::String(self.document_hash.clone().unwrap_or_default()),
        ])
    }
}

/// Validated input of the registration form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDraft {
    pub state: String,
    pub district: String,
    pub village: String,
    pub survey_number: String,
    pub owner: Address,
    pub market_value: u128,
    pub document_hash: String,
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{decode_one, encode};

    fn addr(last: u8) -> Address {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Address::from_bytes(bytes)
    }

    fn property(status: PropertyStatus, owner: Address, is_active: bool) -> Property {
        Property {
            id: 1,
            state: "Karnataka".into(),
            district: "Mysuru".into(),
            village: "Hunsur".into(),
            survey_number: "SY-101".into(),
            owner,
            market_value: 2_000_000_000_000_000_000,
            reference_id: "KA-MYS-0001".into(),
            document_hash: Some("QmDoc".into()),
            status,
            registered_at: 1_700_000_000,
            last_updated: 1_700_000_000,
            is_active,
        }
    }

    #[test]
    fn addresses_compare_case_insensitively() {
        let lower: Address = "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd".parse().unwrap();
        let upper: Address = "0xABCDEFABCDEFABCDEFABCDEFABCDEFABCDEFABCD".parse().unwrap();
        assert_eq!(lower, upper);
        assert_eq!(upper.to_string(), "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd");
        assert!("0x1234".parse::<Address>().is_err());
    }

    #[test]
    fn availability_requires_active_listing_by_someone_else() {
        let me = addr(1);
        let other = addr(2);
        assert!(property(PropertyStatus::ListedForSale, other, true).is_available_for(&me));
        assert!(!property(PropertyStatus::ListedForSale, me, true).is_available_for(&me));
        assert!(!property(PropertyStatus::ListedForSale, other, false).is_available_for(&me));
        assert!(!property(PropertyStatus::Approved, other, true).is_available_for(&me));
    }

    #[test]
    fn decodes_property_from_contract_tuple() {
        let original = property(PropertyStatus::Approved, addr(7), true);
        let data = encode(&[original.to_token()]);
        let decoded = Property::from_token(decode_one(Property::schema(), &data).unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn empty_document_hash_reads_as_none() {
        let mut original = property(PropertyStatus::Pending, addr(7), true);
        original.document_hash = None;
        let data = encode(&[original.to_token()]);
        let decoded = Property::from_token(decode_one(Property::schema(), &data).unwrap()).unwrap();
        assert_eq!(decoded.document_hash, None);
    }

    #[test]
    fn rejects_unknown_status_code() {
        let mut token = property(PropertyStatus::Pending, addr(7), true).to_token();
        if let Token::Tuple(fields) = &mut token {
            fields[9] = Token::Uint(9);
        }
        assert!(Property::from_token(token).is_err());
    }

    #[test]
    fn market_value_beyond_128_bits_is_a_decode_error() {
        let original = property(PropertyStatus::Approved, addr(7), true);
        let mut data = encode(&[original.to_token()]);
        let value = original.market_value.to_be_bytes();
        let at = data
            .windows(16)
            .position(|w| w == value)
            .unwrap();
        // set a bit above the low 128 of the market value word
        data[at - 1] = 1;
        assert_eq!(
            decode_one(Property::schema(), &data).unwrap_err(),
            AbiError::Overflow
        );
    }

    #[test]
    fn parses_status_filters() {
        assert_eq!("3".parse::<PropertyStatus>().unwrap(), PropertyStatus::ListedForSale);
        assert_eq!(
            "purchase_pending".parse::<PropertyStatus>().unwrap(),
            PropertyStatus::PurchasePending
        );
        assert!("7".parse::<PropertyStatus>().is_err());
    }

    #[test]
    fn formats_registration_date() {
        let p = property(PropertyStatus::Approved, addr(1), true);
        assert_eq!(p.registered_on(), "Nov 14, 2023");
        assert_eq!(p.market_value_display(), "2.0");
    }
}
