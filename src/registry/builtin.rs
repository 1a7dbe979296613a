// Built-in dataset definitions

use crate::constants::*;
use crate::domain::{
    AggregateSpec, ArithmeticOp, CalendarField, Dataset, DatePart, FieldSpec, FieldType, Reduction,
    ReplaceMode, TransformRule,
};

pub fn calendar() -> Dataset {
    Dataset::new(CALENDAR, vec![FieldSpec::required("Date", FieldType::Date)])
        .with_rules(vec![TransformRule::DeriveCalendar {
            source: "Date".into(),
            parts: vec![
                CalendarField {
                    part: DatePart::Month,
                    target: "Month".into(),
                },
                CalendarField {
                    part: DatePart::Year,
                    target: "Year".into(),
                },
            ],
        }])
        .with_identity(&["Date"])
        .with_partition_field("Date")
        .with_output_order(&["Date", "Month", "Year"])
}

pub fn customer() -> Dataset {
    Dataset::new(
        CUSTOMER,
        vec![
            FieldSpec::required("CustomerKey", FieldType::Int),
            FieldSpec::optional("Prefix", FieldType::String),
            FieldSpec::required("FirstName", FieldType::String),
            FieldSpec::required("LastName", FieldType::String),
            FieldSpec::optional("BirthDate", FieldType::Date),
            FieldSpec::optional("EmailAddress", FieldType::String),
            FieldSpec::optional("AnnualIncome", FieldType::Float),
        ],
    )
    .with_rules(vec![TransformRule::Concat {
        sources: vec!["Prefix".into(), "FirstName".into(), "LastName".into()],
        separator: " ".into(),
        target: "FullName".into(),
        skip_nulls: true,
    }])
    .with_identity(&["CustomerKey"])
    .with_output_order(&[
        "CustomerKey",
        "FullName",
        "BirthDate",
        "EmailAddress",
        "AnnualIncome",
    ])
}

pub fn product() -> Dataset {
    Dataset::new(
        PRODUCT,
        vec![
            FieldSpec::required("ProductKey", FieldType::Int),
            FieldSpec::required("ProductSKU", FieldType::String),
            FieldSpec::required("ProductName", FieldType::String),
            FieldSpec::required("ProductCost", FieldType::Float),
            FieldSpec::required("ProductPrice", FieldType::Float),
        ],
    )
    .with_rules(vec![
        TransformRule::SplitSegment {
            source: "ProductSKU".into(),
            delimiter: "-".into(),
            index: 0,
            target: "SKUType".into(),
        },
        TransformRule::Compute {
            left: "ProductPrice".into(),
            right: "ProductCost".into(),
            op: ArithmeticOp::Subtract,
            target: "Margin".into(),
        },
    ])
    .with_identity(&["ProductKey"])
    .with_output_order(&[
        "ProductKey",
        "ProductSKU",
        "SKUType",
        "ProductName",
        "ProductCost",
        "ProductPrice",
        "Margin",
    ])
}

pub fn sales() -> Dataset {
    Dataset::new(
        SALES,
        vec![
            FieldSpec::required("OrderNumber", FieldType::String),
            FieldSpec::required("Qty", FieldType::Int),
            FieldSpec::required("LineItem", FieldType::Int),
            FieldSpec::optional("OrderDate", FieldType::Date),
            FieldSpec::optional("ProductKey", FieldType::Int),
            FieldSpec::optional("CustomerKey", FieldType::Int),
            FieldSpec::optional("TerritoryKey", FieldType::Int),
        ],
    )
    .with_rules(vec![
        TransformRule::Replace {
            source: "OrderNumber".into(),
            pattern: "S".into(),
            replacement: "T".into(),
            target: None,
            mode: ReplaceMode::Prefix,
        },
        TransformRule::Compute {
            left: "Qty".into(),
            right: "LineItem".into(),
            op: ArithmeticOp::Multiply,
            target: "Multiply".into(),
        },
    ])
    .with_identity(&["OrderNumber", "LineItem"])
    .with_partition_field("OrderDate")
    .with_output_order(&[
        "OrderNumber",
        "LineItem",
        "OrderDate",
        "ProductKey",
        "CustomerKey",
        "TerritoryKey",
        "Qty",
        "Multiply",
    ])
    .with_aggregate(AggregateSpec {
        name: SALES_BY_TERRITORY.into(),
        grouping: vec!["TerritoryKey".into()],
        reduction: Reduction::Sum {
            field: "Multiply".into(),
            output: "TotalMultiply".into(),
        },
    })
    .with_aggregate(AggregateSpec {
        name: TOP_PRODUCTS.into(),
        grouping: vec!["ProductKey".into()],
        reduction: Reduction::TopN {
            n: 10,
            output: "OrderLines".into(),
        },
    })
}

pub fn territory() -> Dataset {
    Dataset::new(
        TERRITORY,
        vec![
            FieldSpec::required("SalesTerritoryKey", FieldType::Int),
            FieldSpec::required("Region", FieldType::String),
            FieldSpec::required("Country", FieldType::String),
            FieldSpec::optional("Continent", FieldType::String),
        ],
    )
    .with_identity(&["SalesTerritoryKey"])
}

pub fn returns() -> Dataset {
    Dataset::new(
        RETURNS,
        vec![
            FieldSpec::required("ReturnDate", FieldType::String),
            FieldSpec::optional("TerritoryKey", FieldType::Int),
            FieldSpec::required("ProductKey", FieldType::Int),
            FieldSpec::required("ReturnQuantity", FieldType::Int),
        ],
    )
    .with_rules(vec![TransformRule::ParseTimestamp {
        source: "ReturnDate".into(),
        format: "%m/%d/%Y".into(),
        target: "ReturnedAt".into(),
    }])
    .with_identity(&["ReturnedAt", "TerritoryKey", "ProductKey"])
    .with_output_order(&["ReturnedAt", "TerritoryKey", "ProductKey", "ReturnQuantity"])
    .with_aggregate(AggregateSpec {
        name: RETURNS_BY_PRODUCT.into(),
        grouping: vec!["ProductKey".into()],
        reduction: Reduction::Sum {
            field: "ReturnQuantity".into(),
            output: "TotalReturned".into(),
        },
    })
}

pub fn commits() -> Dataset {
    Dataset::new(
        COMMITS,
        vec![
            FieldSpec::required("sha", FieldType::String),
            FieldSpec::required("author", FieldType::String),
            FieldSpec::required("committed_at", FieldType::Timestamp),
            FieldSpec::optional("message", FieldType::String),
            FieldSpec::optional("repo", FieldType::String),
        ],
    )
    .with_identity(&["sha"])
    .with_tie_break("committed_at")
    .with_partition_field("committed_at")
    .with_aggregate(AggregateSpec {
        name: COMMIT_SUMMARY.into(),
        grouping: vec!["author".into()],
        reduction: Reduction::Count {
            output: "commit_count".into(),
        },
    })
    .with_aggregate(AggregateSpec {
        name: TOP_CONTRIBUTORS.into(),
        grouping: vec!["author".into()],
        reduction: Reduction::TopN {
            n: 10,
            output: "commit_count".into(),
        },
    })
}

pub fn all() -> Vec<Dataset> {
    vec![
        calendar(),
        customer(),
        product(),
        sales(),
        territory(),
        returns(),
        commits(),
    ]
}
