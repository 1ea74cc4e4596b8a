use sha2::{Digest, Sha256};
use uuid::Uuid;

pub fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex_digest(&Sha256::digest(bytes))
}

fn salted(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex_digest(&hasher.finalize())
}

/// Stored form is `salt$hexdigest`.
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    format!("{}${}", salt, salted(&salt, password))
}

pub fn verify_password(stored: &str, password: &str) -> bool {
    let Some((salt, digest)) = stored.split_once('$') else {
        return false;
    };
    salted(salt, password) == digest
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_verifies_and_is_salted() {
        let a = hash_password("s3cret");
        let b = hash_password("s3cret");
        assert_ne!(a, b);
        assert!(verify_password(&a, "s3cret"));
        assert!(verify_password(&b, "s3cret"));
        assert!(!verify_password(&a, "S3cret"));
    }

    #[test]
    fn malformed_stored_value_never_verifies() {
        assert!(!verify_password("plaintext", "plaintext"));
        assert!(!verify_password("", ""));
    }

    #[test]
    fn digest_is_lowercase_hex() {
        assert_eq!(hex_digest(&[0x00, 0xab, 0x7f]), "00ab7f");
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn emails_compare_case_insensitively() {
        assert_eq!(normalize_email("  Ana@Uni.TN "), "ana@uni.tn");
    }
}
