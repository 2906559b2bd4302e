use rand::Rng;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a random alphanumeric id of the given length.
///
/// Used for session ids, device ids, socket ids and correlation ids.
/// Collision-resistant for the lifetime of a connection; no cross-restart
/// persistence is required.
pub fn make_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
