#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("mock {name} no longer present at the expected (sortOrder={sort_order}, id={id})")]
	StaleMock { name: String, sort_order: i64, id: u64 },

	#[error("no session registered for id {0}")]
	NoSession(u64),
}
