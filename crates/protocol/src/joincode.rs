//! Portable join codes.
//!
//! A join code packs a hub host and an invite code into one compact,
//! self-describing string a person can read over the phone:
//! `[version byte][host bytes][NUL][invite bytes]`, base-32 encoded with
//! an alphabet that drops the ambiguous characters I, L, O and U, then
//! grouped into 4-character dashed chunks.

use rand::Rng;

/// Crockford base-32 alphabet (no I, L, O, U).
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Current join-code layout version.
pub const JOIN_CODE_VERSION: u8 = 1;

/// Length of generated invite codes, in alphabet characters.
const INVITE_CODE_LEN: usize = 8;

/// Errors from join-code decoding and encoding.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum JoinCodeError {
    #[error("empty host or invite code")]
    Empty,

    #[error("host and invite code must be ASCII without NUL bytes")]
    InvalidInput,

    #[error("invalid character {0:?} in join code")]
    BadChar(char),

    #[error("unsupported join code version {0}")]
    BadVersion(u8),

    #[error("join code is missing the host separator")]
    MissingSeparator,
}

/// Encodes a host and invite code into a portable join code.
pub fn encode(host: &str, invite: &str) -> Result<String, JoinCodeError> {
    if host.is_empty() || invite.is_empty() {
        return Err(JoinCodeError::Empty);
    }
    if !host.is_ascii()
        || !invite.is_ascii()
        || host.bytes().any(|b| b == 0)
        || invite.bytes().any(|b| b == 0)
    {
        return Err(JoinCodeError::InvalidInput);
    }

    let mut data = Vec::with_capacity(2 + host.len() + invite.len());
    data.push(JOIN_CODE_VERSION);
    data.extend_from_slice(host.as_bytes());
    data.push(0);
    data.extend_from_slice(invite.as_bytes());

    // 5-bit groups, final group zero-padded.
    let mut raw = String::with_capacity(data.len() * 8 / 5 + 1);
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    for byte in data {
        acc = (acc << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            raw.push(ALPHABET[((acc >> bits) & 31) as usize] as char);
        }
    }
    if bits > 0 {
        raw.push(ALPHABET[((acc << (5 - bits)) & 31) as usize] as char);
    }

    let mut grouped = String::with_capacity(raw.len() + raw.len() / 4);
    for (i, ch) in raw.chars().enumerate() {
        if i > 0 && i % 4 == 0 {
            grouped.push('-');
        }
        grouped.push(ch);
    }
    Ok(grouped)
}

/// Decodes a portable join code back into `(host, invite)`.
///
/// Dashes are ignored and letters are case-insensitive.
pub fn decode(code: &str) -> Result<(String, String), JoinCodeError> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let mut data = Vec::new();
    for ch in code.chars() {
        if ch == '-' {
            continue;
        }
        let upper = ch.to_ascii_uppercase();
        let value = ALPHABET
            .iter()
            .position(|&a| a as char == upper)
            .ok_or(JoinCodeError::BadChar(ch))? as u32;
        acc = (acc << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            data.push(((acc >> bits) & 0xff) as u8);
        }
    }
    // Remaining bits (< 8) are encoding padding.

    if data.is_empty() {
        return Err(JoinCodeError::Empty);
    }
    if data[0] != JOIN_CODE_VERSION {
        return Err(JoinCodeError::BadVersion(data[0]));
    }
    let body = &data[1..];
    let sep = body
        .iter()
        .position(|&b| b == 0)
        .ok_or(JoinCodeError::MissingSeparator)?;
    let (host, invite) = (&body[..sep], &body[sep + 1..]);
    if host.is_empty() || invite.is_empty() {
        return Err(JoinCodeError::Empty);
    }
    let host = String::from_utf8(host.to_vec()).map_err(|_| JoinCodeError::InvalidInput)?;
    let invite = String::from_utf8(invite.to_vec()).map_err(|_| JoinCodeError::InvalidInput)?;
    Ok((host, invite))
}

/// Generates a random invite code from the join-code alphabet.
pub fn generate_invite_code() -> String {
    let mut rng = rand::thread_rng();
    (0..INVITE_CODE_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_simple() {
        let code = encode("hub.example.org:9470", "W7Q2M4KX").unwrap();
        let (host, invite) = decode(&code).unwrap();
        assert_eq!(host, "hub.example.org:9470");
        assert_eq!(invite, "W7Q2M4KX");
    }

    #[test]
    fn roundtrip_various_inputs() {
        for (host, invite) in [
            ("a", "b"),
            ("localhost", "1"),
            ("hub.test:1234", "code-with-dash"),
            ("10.0.0.1:80", "~!@#$%^&*()"),
        ] {
            let code = encode(host, invite).unwrap();
            assert_eq!(decode(&code).unwrap(), (host.to_string(), invite.to_string()));
        }
    }

    #[test]
    fn output_is_dashed_groups_of_four() {
        let code = encode("hub.example.org", "ABCD1234").unwrap();
        for (i, chunk) in code.split('-').enumerate() {
            assert!(chunk.len() <= 4, "chunk {i} too long in {code}");
            assert!(chunk.chars().all(|c| ALPHABET.contains(&(c as u8))));
        }
    }

    #[test]
    fn decode_is_case_insensitive() {
        let code = encode("host", "INVITE01").unwrap();
        let lowered = code.to_ascii_lowercase();
        assert_eq!(decode(&lowered).unwrap().1, "INVITE01");
    }

    #[test]
    fn rejects_empty_and_nul() {
        assert_eq!(encode("", "x"), Err(JoinCodeError::Empty));
        assert_eq!(encode("h", ""), Err(JoinCodeError::Empty));
        assert_eq!(encode("h\0st", "x"), Err(JoinCodeError::InvalidInput));
        assert_eq!(encode("héte", "x"), Err(JoinCodeError::InvalidInput));
    }

    #[test]
    fn rejects_bad_characters() {
        assert!(matches!(decode("ABCU"), Err(JoinCodeError::BadChar('U'))));
        assert!(matches!(decode("AB!D"), Err(JoinCodeError::BadChar('!'))));
    }

    #[test]
    fn rejects_wrong_version() {
        // Version byte 2 encodes to a leading nonzero pattern this build
        // does not understand.
        let mut data = vec![2u8];
        data.extend_from_slice(b"h");
        data.push(0);
        data.extend_from_slice(b"i");
        // Hand-encode with the same alphabet.
        let mut raw = String::new();
        let mut acc: u32 = 0;
        let mut bits = 0u32;
        for b in data {
            acc = (acc << 8) | u32::from(b);
            bits += 8;
            while bits >= 5 {
                bits -= 5;
                raw.push(ALPHABET[((acc >> bits) & 31) as usize] as char);
            }
        }
        if bits > 0 {
            raw.push(ALPHABET[((acc << (5 - bits)) & 31) as usize] as char);
        }
        assert!(matches!(decode(&raw), Err(JoinCodeError::BadVersion(2))));
    }

    #[test]
    fn generated_invite_codes_use_alphabet() {
        let code = generate_invite_code();
        assert_eq!(code.len(), 8);
        assert!(code.bytes().all(|b| ALPHABET.contains(&b)));
        assert_ne!(generate_invite_code(), generate_invite_code());
    }
}
