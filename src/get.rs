//! Stored email retrieval by row id, for `jobtrail get`.

use anyhow::{bail, Result};

use crate::email_store::EmailStore;
use crate::models::StoredEmail;

pub async fn get_email(store: &EmailStore, row_id: i64) -> Result<StoredEmail> {
    match store.get(row_id).await? {
        Some(email) => Ok(email),
        None => bail!("email not found: {}", row_id),
    }
}

/// Print an email and its classification to stdout.
pub fn print_email(stored: &StoredEmail) {
    let e = &stored.email;

    println!("--- Email ---");
    println!("row_id:       {}", stored.row_id);
    println!("external_id:  {}", e.external_id);
    println!("account:      {}", e.account);
    println!("subject:      {}", e.subject);
    println!("from:         {}", e.sender);
    println!("to:           {}", e.recipient);
    println!("received_at:  {}", e.received_at.format("%Y-%m-%dT%H:%M:%SZ"));
    if !e.company.is_empty() {
        println!("company:      {}", e.company);
    }
    if !e.labels.is_empty() {
        println!("labels:       {}", e.labels.join(", "));
    }
    if let Some(id) = &stored.embedding_id {
        println!("index_id:     {}", id);
    }
    println!();

    println!("--- Classification ---");
    match &stored.classification {
        Some(c) => {
            println!("category:     {}", c.category);
            println!("confidence:   {:.2}", c.confidence);
            println!("source:       {}", c.source.as_str());
            println!("summary:      {}", c.summary);
            if !c.key_info.is_empty() {
                println!(
                    "key_info:     {}",
                    serde_json::Value::Object(c.key_info.clone())
                );
            }
        }
        None => println!("(pending)"),
    }
    println!();

    println!("--- Body ---");
    println!("{}", if e.body.is_empty() { &e.snippet } else { &e.body });
}
