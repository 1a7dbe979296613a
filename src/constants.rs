/// Dataset name constants for the built-in registry.
/// New datasets are onboarded through JSON definitions, not new constants.
pub const CALENDAR: &str = "Calendar";
pub const CUSTOMER: &str = "Customer";
pub const PRODUCT: &str = "Product";
pub const SALES: &str = "Sales";
pub const TERRITORY: &str = "Territory";
pub const RETURNS: &str = "Returns";
pub const COMMITS: &str = "Commits";

// Curated entities derived from the built-ins
pub const COMMIT_SUMMARY: &str = "CommitSummary";
pub const TOP_CONTRIBUTORS: &str = "TopContributors";
pub const SALES_BY_TERRITORY: &str = "SalesByTerritory";
pub const TOP_PRODUCTS: &str = "TopProducts";
pub const RETURNS_BY_PRODUCT: &str = "ReturnsByProduct";

// Storage layout
pub const MANIFEST_FILE: &str = "_manifest.json";
pub const LOCK_FILE: &str = "_lock";
pub const REJECTS_FILE: &str = "rejects.ndjson";
pub const META_DIR: &str = "_meta";
pub const IDENTITY_DB: &str = "identity.db";
pub const CATALOG_DIR: &str = "_catalog";
pub const CATALOG_FILE: &str = "catalog.json";

/// Raw partition for records whose partition field is missing or not a date.
pub const UNDATED_PARTITION: &str = "undated";

/// Partition key used for curated outputs computed over every committed partition.
pub const ALL_PARTITIONS: &str = "all";

/// Column added to every curated row recording whether its window was complete.
pub const WINDOW_COMPLETE_FIELD: &str = "window_complete";
/// Column added to top-N rows.
pub const RANK_FIELD: &str = "rank";

/// Get all built-in dataset names
pub fn builtin_datasets() -> Vec<&'static str> {
    vec![CALENDAR, CUSTOMER, PRODUCT, SALES, TERRITORY, RETURNS, COMMITS]
}
