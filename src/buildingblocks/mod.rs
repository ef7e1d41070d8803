pub mod aead;
pub mod field;
pub mod full_domain_hash;
pub mod integer_shamir;
pub mod joye_libert;
pub mod key_agreement;
pub mod prg;
pub mod shamir;
pub mod utils;
pub mod vector_encoding;
