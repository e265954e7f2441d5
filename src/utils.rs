use rand::Rng;

const CLIENT_ID: &[u8; 2] = b"MN";
const CLIENT_VERSION: &[u8; 4] = b"0010";

/// Azureus-style peer id: `-MN0010-` followed by twelve random decimal
/// digits. Regenerated per run so trackers see a fresh identity.
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[0] = b'-';
    id[1..3].copy_from_slice(CLIENT_ID);
    id[3..7].copy_from_slice(CLIENT_VERSION);
    id[7] = b'-';
    let mut rng = rand::thread_rng();
    for digit in id[8..].iter_mut() {
        *digit = b'0' + rng.gen_range(0..10);
    }
    id
}

/// Port reported to trackers when the user does not pin one.
pub fn random_listen_port() -> u16 {
    rand::thread_rng().gen_range(10000..20000)
}
