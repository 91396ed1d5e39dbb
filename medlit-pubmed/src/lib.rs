//! # Medlit PubMed
//!
//! NCBI E-utilities implementation of [`medlit_core::MetadataSource`]:
//! batched article summaries (`esummary`), abstracts (`efetch`), cited-by
//! counts (`elink`), and title/author lookup (`esearch`).

pub mod author;
pub mod client;
pub mod parse;

pub use author::{build_search_term, extract_surname};
pub use client::PubMedClient;
