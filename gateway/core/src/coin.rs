// Copyright (c) 2024 The Botho Foundation

//! Supported cryptocurrencies and their address formats.

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

/// Cryptocurrencies the gateway can issue payment sessions for.
///
/// Every supported coin is an EVM account chain with an 18-decimal native
/// unit, so one signer family and one RPC client cover all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cryptocurrency {
    /// Ether on Ethereum mainnet
    Eth,
    /// BNB on BNB Smart Chain
    Bnb,
    /// MATIC/POL on Polygon PoS
    Matic,
}

impl Cryptocurrency {
    /// All supported coins, in a stable order.
    pub const ALL: [Cryptocurrency; 3] = [
        Cryptocurrency::Eth,
        Cryptocurrency::Bnb,
        Cryptocurrency::Matic,
    ];

    /// Short lowercase code used in config keys and the session record.
    pub fn code(&self) -> &'static str {
        match self {
            Cryptocurrency::Eth => "eth",
            Cryptocurrency::Bnb => "bnb",
            Cryptocurrency::Matic => "matic",
        }
    }

    /// Number of decimals of the native unit.
    pub fn decimals(&self) -> u32 {
        18
    }

    /// SLIP-44 coin type used in the BIP-44 derivation path.
    pub fn default_coin_type(&self) -> u32 {
        match self {
            Cryptocurrency::Eth => 60,
            Cryptocurrency::Bnb => 9006,
            Cryptocurrency::Matic => 966,
        }
    }

    /// EIP-155 chain id of the main network.
    pub fn default_chain_id(&self) -> u64 {
        match self {
            Cryptocurrency::Eth => 1,
            Cryptocurrency::Bnb => 56,
            Cryptocurrency::Matic => 137,
        }
    }

    /// Confirmations before a deposit is treated as final.
    pub fn default_confirmations(&self) -> u64 {
        match self {
            Cryptocurrency::Eth => 12,
            Cryptocurrency::Bnb => 15,
            Cryptocurrency::Matic => 64,
        }
    }

    /// Ticker used when asking a price source for a USD quote.
    pub fn price_id(&self) -> &'static str {
        match self {
            Cryptocurrency::Eth => "ethereum",
            Cryptocurrency::Bnb => "binancecoin",
            Cryptocurrency::Matic => "matic-network",
        }
    }
}

impl std::fmt::Display for Cryptocurrency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl std::str::FromStr for Cryptocurrency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "eth" | "ethereum" => Ok(Cryptocurrency::Eth),
            "bnb" | "bsc" => Ok(Cryptocurrency::Bnb),
            "matic" | "pol" | "polygon" => Ok(Cryptocurrency::Matic),
            _ => Err(format!("Unknown cryptocurrency: {}", s)),
        }
    }
}

/// Validate an EVM address: `0x` followed by 40 hex characters.
pub fn validate_address(address: &str) -> Result<(), String> {
    if !address.starts_with("0x") {
        return Err("address must start with 0x".to_string());
    }
    if address.len() != 42 {
        return Err(format!(
            "address must be 42 characters, got {}",
            address.len()
        ));
    }
    if !address[2..].chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("address must be valid hex".to_string());
    }
    Ok(())
}

/// Parse a validated EVM address.
pub fn parse_address(address: &str) -> Result<Address, String> {
    validate_address(address)?;
    address.parse::<Address>().map_err(|e| e.to_string())
}

/// Compare two EVM addresses ignoring EIP-55 checksum casing.
pub fn same_address(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coin_parsing() {
        assert_eq!("eth".parse::<Cryptocurrency>().unwrap(), Cryptocurrency::Eth);
        assert_eq!("Ethereum".parse::<Cryptocurrency>().unwrap(), Cryptocurrency::Eth);
        assert_eq!("bsc".parse::<Cryptocurrency>().unwrap(), Cryptocurrency::Bnb);
        assert_eq!("polygon".parse::<Cryptocurrency>().unwrap(), Cryptocurrency::Matic);
        assert!("doge".parse::<Cryptocurrency>().is_err());
    }

    #[test]
    fn test_coin_serde_code() {
        let json = serde_json::to_string(&Cryptocurrency::Matic).unwrap();
        assert_eq!(json, "\"matic\"");
        for coin in Cryptocurrency::ALL {
            assert_eq!(coin.to_string().parse::<Cryptocurrency>().unwrap(), coin);
        }
    }

    #[test]
    fn test_address_validation() {
        assert!(validate_address("0x1234567890abcdef1234567890abcdef12345678").is_ok());
        assert!(validate_address("1234567890abcdef1234567890abcdef12345678").is_err());
        assert!(validate_address("0x1234").is_err());
        assert!(validate_address("0x1234567890abcdef1234567890abcdef1234567g").is_err());
    }

    #[test]
    fn test_parse_address() {
        let parsed = parse_address("0x9858EfFD232B4033E47d90003D41EC34EcaEda94").unwrap();
        assert_eq!(
            parsed.to_checksum(None),
            "0x9858EfFD232B4033E47d90003D41EC34EcaEda94"
        );
        assert!(parse_address("9858EfFD232B4033E47d90003D41EC34EcaEda94").is_err());
    }

    #[test]
    fn test_same_address_ignores_checksum_case() {
        assert!(same_address(
            "0x9858EfFD232B4033E47d90003D41EC34EcaEda94",
            "0x9858effd232b4033e47d90003d41ec34ecaeda94"
        ));
    }
}
