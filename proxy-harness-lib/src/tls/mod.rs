mod certificate;
mod client;

pub use certificate::{
    file_stem, issue, material_paths, validate_hostname, CertificateRecord, CERTS_DIR,
    PRIVATE_DIR, VALIDITY,
};
pub use client::insecure_client_config;
