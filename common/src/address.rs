use thiserror::Error;

// An address is the network symbol followed by a 40 character hex body.
// For accounts that have not yet registered a sig public key, the body
// doubles as the first 40 hex characters of the key that is allowed to
// authenticate the first transaction.
pub const ADDRESS_BODY_LENGTH: usize = 40;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Address {address} did not have the expected {expected} network symbol prefix")]
    WrongNetworkSymbol { address: String, expected: String },

    #[error("Address {0} did not have a valid {ADDRESS_BODY_LENGTH} character hex body")]
    InvalidBody(String),
}

fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

// Validate the full address shape against the expected network symbol
pub fn validate_address(network_symbol: &str, address: &str) -> Result<(), AddressError> {
    address_body(network_symbol, address).map(|_| ())
}

// Split off and validate the hex body of an address
pub fn address_body<'a>(
    network_symbol: &str,
    address: &'a str,
) -> Result<&'a str, AddressError> {
    let body = address
        .strip_prefix(network_symbol)
        .ok_or_else(|| AddressError::WrongNetworkSymbol {
            address: address.to_string(),
            expected: network_symbol.to_string(),
        })?;
    if body.len() != ADDRESS_BODY_LENGTH || !is_lower_hex(body) {
        return Err(AddressError::InvalidBody(address.to_string()));
    }
    Ok(body)
}

// Derive the address that belongs to an initial sig public key
pub fn address_from_public_key(network_symbol: &str, public_key: &str) -> String {
    format!("{}{}", network_symbol, &public_key[..ADDRESS_BODY_LENGTH])
}

// First-use authentication: an account without a recorded sig public key
// accepts a key whose first 40 hex characters equal the address body
pub fn public_key_matches_address(network_symbol: &str, address: &str, public_key: &str) -> bool {
    match address_body(network_symbol, address) {
        Ok(body) => public_key.len() >= ADDRESS_BODY_LENGTH && &public_key[..ADDRESS_BODY_LENGTH] == body,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "3cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_address_round_trip() {
        let address = address_from_public_key("ldpos", KEY);
        assert!(address.starts_with("ldpos"));
        assert_eq!(address.len(), 5 + ADDRESS_BODY_LENGTH);
        assert!(validate_address("ldpos", &address).is_ok());
        assert!(public_key_matches_address("ldpos", &address, KEY));
    }

    #[test]
    fn test_wrong_network_symbol() {
        let address = address_from_public_key("ldpos", KEY);
        assert_eq!(
            validate_address("clsk", &address),
            Err(AddressError::WrongNetworkSymbol {
                address: address.clone(),
                expected: "clsk".to_string(),
            })
        );
    }

    #[test]
    fn test_invalid_body() {
        assert!(validate_address("ldpos", "ldpos123").is_err());
        assert!(validate_address("ldpos", &format!("ldpos{}", "Z".repeat(40))).is_err());
    }

    #[test]
    fn test_key_mismatch() {
        let address = address_from_public_key("ldpos", KEY);
        let other = "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";
        assert!(!public_key_matches_address("ldpos", &address, other));
    }
}
