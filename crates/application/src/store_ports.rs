mod cache;
mod repository;

pub use cache::{CacheStore, remember};
pub use repository::{
    ActionRepository, EntityRepository, EntityTypeRepository, PersistenceStores,
    PropertyRepository, ServiceRepository,
};
