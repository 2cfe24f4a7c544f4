use tracing::debug;

use crate::errors::SelectionError;
use crate::predicate::{Bindings, Predicate, PredicateParser, Schema, Value, ValueType};
use crate::proxmox::{ProxmoxApi, StoragePool};

/// Variables a storage selector can refer to.
pub fn storage_schema() -> Schema {
    Schema::new()
        .variable("name", ValueType::String)
        .variable("node", ValueType::String)
        .variable("storageType", ValueType::String)
        .variable("availableSpace", ValueType::Uint)
}

fn bindings(node: &str, pool: &StoragePool) -> Bindings {
    let mut bindings = Bindings::new();
    bindings.insert("name".to_string(), Value::from(pool.storage.as_str()));
    bindings.insert("node".to_string(), Value::from(node));
    bindings.insert("storageType".to_string(), Value::from(pool.storage_type.as_str()));
    bindings.insert("availableSpace".to_string(), Value::Uint(pool.avail));
    bindings
}

/// Parses `selector` against [`storage_schema`].
pub fn compile(
    parser: &dyn PredicateParser,
    selector: &str,
) -> Result<Box<dyn Predicate>, SelectionError> {
    parser
        .parse(selector, &storage_schema())
        .map_err(|source| SelectionError::InvalidSelector {
            selector: selector.to_string(),
            source,
        })
}

/// First pool, in listing order, for which the predicate holds. An
/// evaluation error on any pool aborts the search.
pub fn pick_from<'a>(
    predicate: &dyn Predicate,
    selector: &str,
    node: &str,
    pools: &'a [StoragePool],
) -> Result<&'a StoragePool, SelectionError> {
    for pool in pools {
        let matched = predicate.evaluate(&bindings(node, pool)).map_err(|source| {
            SelectionError::SelectorEvaluation {
                selector: selector.to_string(),
                storage: pool.storage.clone(),
                source,
            }
        })?;

        if matched {
            debug!(node, storage = %pool.storage, selector, "storage matched");
            return Ok(pool);
        }
    }

    Err(SelectionError::NoStorageMatch {
        selector: selector.to_string(),
    })
}

/// Lists the node's storages and returns the name of the first match. The
/// selector is compiled before the listing is fetched.
pub async fn pick_storage<A: ProxmoxApi + ?Sized>(
    api: &A,
    parser: &dyn PredicateParser,
    node: &str,
    selector: &str,
) -> Result<String, SelectionError> {
    let predicate = compile(parser, selector)?;

    let pools = api
        .storages(node)
        .await
        .map_err(|source| SelectionError::StorageListing {
            node: node.to_string(),
            source,
        })?;

    pick_from(predicate.as_ref(), selector, node, &pools).map(|pool| pool.storage.clone())
}
