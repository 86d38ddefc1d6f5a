//! Ingest a few support articles, retrieve for a question, and score two candidate answers.
//!
//! Run with `RUST_LOG=relay_rag=debug` to see retrieval and scoring details.

use std::sync::Arc;

use relay_core::EmbeddingModel;
use relay_rag::{IngestDocument, KnowledgeBase, RagConfig};
use tracing_subscriber::EnvFilter;

/// Toy embedder: hashed bag of words, normalized.
struct DemoEmbedder;

impl EmbeddingModel for DemoEmbedder {
    fn dim(&self) -> usize {
        64
    }

    async fn embed(&self, text: &str) -> relay_core::Result<Vec<f32>> {
        let mut vector = vec![0.0; self.dim()];
        for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            let bucket = word
                .to_lowercase()
                .bytes()
                .fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(usize::from(b)));
            vector[bucket % self.dim()] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt().max(f32::EPSILON);
        Ok(vector.into_iter().map(|v| v / norm).collect())
    }
}

#[tokio::main]
async fn main() -> relay_rag::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = RagConfig::builder().chunk_size(64, 8).build();
    let kb = KnowledgeBase::in_memory(Arc::new(DemoEmbedder), config)?;

    let articles = [
        (
            "refunds",
            "# Refunds\n\nRefunds are issued to the original payment method within five \
             business days of approval.",
            "2024-04-02",
        ),
        (
            "shipping",
            "# Shipping\n\nOrders leave the warehouse every weekday. Tracking numbers are \
             emailed once the parcel is scanned.",
            "2024-03-18",
        ),
        (
            "passwords",
            "# Account access\n\nTo reset a password, open Settings, choose Security, and \
             follow the emailed link.",
            "2024-05-09",
        ),
    ];
    for (id, text, date) in articles {
        let report = kb
            .ingest(
                IngestDocument::new(id, text)
                    .with("filename", format!("{id}.md"))
                    .with("upload_date", date),
            )
            .await?;
        println!("ingested {id}: {} chunk(s)", report.indexed);
    }

    let query = "how long do refunds take?";
    let ctx = kb.answer_context(query, None).await;
    println!("\nTop matches for {query:?}:");
    for (rank, hit) in ctx.retrieved.iter().enumerate() {
        println!(
            "{rank}: {} ({:?}, score = {:.3})",
            hit.chunk.id, hit.source, hit.normalized_score
        );
    }

    for answer in [
        "Refunds reach the original payment method within five business days of approval, \
         according to the refunds article. [source: refunds#chunk_0]",
        "I'm not sure, let me transfer you to a human agent.",
    ] {
        let confidence = kb.score(answer, &ctx.retrieved, query);
        println!(
            "\nanswer: {answer}\nconfidence = {:.2}, escalate = {}",
            confidence.score, confidence.should_escalate
        );
    }

    Ok(())
}
