use sha2::Digest;
use sha2::Sha256;

/// Stable short identifier over `(path, content)`: the first 8 hex chars
/// of `SHA-256(path || 0x00 || content)`. Path-salted so identical content
/// at different paths yields different ids; short so the ids stay cheap
/// inside prompts, where they double as the optimistic-concurrency token
/// for edits.
pub fn short_id(path: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(8);
    for byte in digest.iter().take(4) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Hash used to derive stable filenames under `_sections/` and
/// `_external/`: full-width hex over the key string.
pub fn storage_hash(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
