use rand::RngCore;

use crate::ID_LEN;

/// Generate a random 12-hex-character secret ID (48 bits of entropy).
pub fn generate_id(rng: &mut dyn RngCore) -> String {
    let mut bytes = [0u8; ID_LEN / 2];
    rng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
