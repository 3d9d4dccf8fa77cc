//! Fetch command implementation.

use std::net::SocketAddr;
use std::time::Duration;
use tether_model::{AttributeValue, Entity};
use tether_storage::Query;

/// What to fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Type descriptor.
    pub type_descriptor: String,
    /// Page size; 0 means all.
    pub take: u32,
    /// Entities to skip.
    pub skip: u32,
    /// Predicate text.
    pub query: Option<String>,
    /// Include related entities.
    pub include_all: bool,
    /// Fetch ids only.
    pub ids_only: bool,
}

/// Runs the fetch command.
pub async fn run(
    remote: SocketAddr,
    request: FetchRequest,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let query = request.query.as_deref().map(Query::parse).transpose()?;

    let client = super::one_shot_client(remote, Duration::from_secs(5));
    client.connect().await?;

    if request.ids_only {
        let ids = client
            .fetch_ids(&request.type_descriptor, query.as_ref(), request.take)
            .await;
        client.shutdown();
        let ids = ids?;
        match format {
            "json" => println!("{}", serde_json::to_string_pretty(&ids)?),
            _ => ids.iter().for_each(|id| println!("{id}")),
        }
        return Ok(());
    }

    let entities = client
        .fetch_entities(
            &request.type_descriptor,
            query.as_ref(),
            request.take,
            request.skip,
            request.include_all,
        )
        .await;
    client.shutdown();
    let entities = entities?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&entities)?),
        _ => {
            println!("{} {} entities", entities.len(), request.type_descriptor);
            for entity in &entities {
                println!("{}", render(entity));
            }
        }
    }
    Ok(())
}

/// One-line text rendering of an entity.
pub fn render(entity: &Entity) -> String {
    let mut line = format!(
        "{} modified={}",
        entity.id,
        entity.modified_at.format("%Y-%m-%dT%H:%M:%SZ")
    );
    if entity.archived {
        line.push_str(" archived");
    }
    for (name, value) in &entity.attributes {
        line.push_str(&format!(" {name}={}", render_value(value)));
    }
    if !entity.relations.is_empty() {
        line.push_str(&format!(" relations={}", entity.relations.len()));
    }
    line
}

fn render_value(value: &AttributeValue) -> String {
    match value {
        AttributeValue::Null => "null".into(),
        AttributeValue::Bool(b) => b.to_string(),
        AttributeValue::Integer(i) => i.to_string(),
        AttributeValue::Float(f) => f.to_string(),
        AttributeValue::Text(s) => format!("{s:?}"),
        AttributeValue::Timestamp(t) => t.to_rfc3339(),
        AttributeValue::Id(id) => id.to_string(),
        AttributeValue::Bytes(b) => format!("<{} bytes>", b.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_rendering() {
        let mut entity = Entity::new("Person")
            .with("Name", "Ada")
            .with("Age", 36i64)
            .with("Photo", AttributeValue::Bytes(vec![1, 2, 3]));
        entity.archived = true;

        let line = render(&entity);
        assert!(line.starts_with(&entity.id.to_string()));
        assert!(line.contains(" archived"));
        assert!(line.contains("Name=\"Ada\""));
        assert!(line.contains("Age=36"));
        assert!(line.contains("Photo=<3 bytes>"));
    }

    #[test]
    fn entities_serialize_as_json() {
        let entity = Entity::new("Person").with("Name", "Ada");
        let json = serde_json::to_value(vec![entity.clone()]).unwrap();
        assert_eq!(json[0]["type_descriptor"], "Person");
        assert_eq!(json[0]["attributes"]["Name"]["type"], "Text");
        assert_eq!(json[0]["attributes"]["Name"]["value"], "Ada");
    }
}
