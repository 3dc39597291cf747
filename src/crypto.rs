//
// Random values, hashing and constant time compare
//
use data_encoding::{Encoding, BASE64URL_NOPAD, HEXLOWER};
use ring::{digest, hmac};

use crate::error::Error;

pub fn get_random_bytes<const N: usize>() -> [u8; N] {
    use ring::rand::{SecureRandom, SystemRandom};

    let mut array = [0u8; N];
    SystemRandom::new().fill(&mut array).expect("Error generating random values");

    array
}

/// Encodes random bytes using the provided function.
pub fn encode_random_bytes<const N: usize>(e: Encoding) -> String {
    e.encode(&get_random_bytes::<N>())
}

/// Generates a decimal code of the given number of digits, e.g. for
/// phone and email verification. Uniform over the full range.
pub fn generate_code(digits: u32) -> Result<String, Error> {
    if digits > 19 {
        err!("Code size is limited to 19 digits")
    }

    // 8 bytes to create an u64 for up to 19 decimal digits
    let number = u64::from_be_bytes(get_random_bytes::<8>()) % 10u64.pow(digits);
    Ok(format!("{:0size$}", number, size = digits as usize))
}

/// Opaque credential generators. Clients see the raw value exactly once;
/// the store only ever keeps the SHA-256 of it.
pub fn generate_refresh_token() -> String {
    encode_random_bytes::<32>(BASE64URL_NOPAD)
}

pub fn generate_authorization_code() -> String {
    encode_random_bytes::<16>(BASE64URL_NOPAD)
}

pub fn generate_session_token() -> String {
    encode_random_bytes::<64>(BASE64URL_NOPAD)
}

pub fn generate_client_id() -> String {
    format!("app_{}", encode_random_bytes::<18>(BASE64URL_NOPAD))
}

pub fn generate_client_secret() -> String {
    encode_random_bytes::<32>(BASE64URL_NOPAD)
}

/// Hex SHA-256, the at-rest representation of every opaque credential.
pub fn sha256_hex(data: &[u8]) -> String {
    HEXLOWER.encode(digest::digest(&digest::SHA256, data).as_ref())
}

//
// HMAC (webhook payload signatures)
//
pub fn hmac_sha256_hex(key: &[u8], data: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let signature = hmac::sign(&key, data);

    HEXLOWER.encode(signature.as_ref())
}

//
// PKCE transforms (RFC 7636)
//
pub fn pkce_s256(verifier: &str) -> String {
    BASE64URL_NOPAD.encode(digest::digest(&digest::SHA256, verifier.as_bytes()).as_ref())
}

pub fn verify_code_challenge(method: &str, challenge: &str, verifier: &str) -> bool {
    match method {
        "S256" => ct_eq(pkce_s256(verifier), challenge),
        "plain" => ct_eq(verifier, challenge),
        _ => false,
    }
}

//
// Constant time compare
//
pub fn ct_eq<T: AsRef<[u8]>, U: AsRef<[u8]>>(a: T, b: U) -> bool {
    use ring::constant_time::verify_slices_are_equal;

    verify_slices_are_equal(a.as_ref(), b.as_ref()).is_ok()
}

//
// Password hashing (Argon2id, PHC string format)
//
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, SaltString},
    Argon2, PasswordHasher, PasswordVerifier,
};

pub fn hash_password(password: &str) -> Result<String, Error> {
    let salt = SaltString::generate(&mut OsRng);
    match Argon2::default().hash_password(password.as_bytes(), &salt) {
        Ok(hash) => Ok(hash.to_string()),
        Err(e) => err!(Internal, format!("Error hashing password: {e}")),
    }
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_are_decimal_and_padded() {
        for _ in 0..32 {
            let code = generate_code(6).unwrap();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn code_size_is_bounded() {
        assert!(generate_code(20).is_err());
    }

    #[test]
    fn pkce_s256_matches_rfc7636_appendix_b() {
        assert_eq!(
            pkce_s256("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn code_challenge_verification() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

        assert!(verify_code_challenge("S256", challenge, verifier));
        assert!(!verify_code_challenge("S256", challenge, "wrong-verifier"));
        assert!(verify_code_challenge("plain", "abc", "abc"));
        assert!(!verify_code_challenge("plain", "abc", "abd"));
        assert!(!verify_code_challenge("unknown", challenge, verifier));
    }

    #[test]
    fn hmac_signature_is_stable_and_tamper_evident() {
        let sig = hmac_sha256_hex(b"secret", br#"{"event":"user.created"}"#);
        assert_eq!(sig, hmac_sha256_hex(b"secret", br#"{"event":"user.created"}"#));
        assert_ne!(sig, hmac_sha256_hex(b"secret", br#"{"event":"user.createe"}"#));
        assert_ne!(sig, hmac_sha256_hex(b"secret2", br#"{"event":"user.created"}"#));
    }

    #[test]
    fn password_hash_roundtrip() {
        let phc = hash_password("hunter2!").unwrap();
        assert!(phc.starts_with("$argon2"));
        assert!(verify_password("hunter2!", &phc));
        assert!(!verify_password("hunter3!", &phc));
        assert!(!verify_password("hunter2!", "not-a-phc-string"));
    }
}
