mod record;
mod store;

pub use record::FileRecord;
pub use store::RecordStore;
