//! Keygen command handler.

use crate::crypto::generate_keypair;

/// Print a fresh keypair. The private half goes to stdout only.
pub fn handle_keygen() {
    let keys = generate_keypair();
    println!("public:  {}", keys.public);
    println!("private: {}", keys.private.to_hex().as_str());
}
