use super::{Predicate, RuleDefinition};

/// Return the built-in rules with their default severities.
pub fn default_rules() -> Vec<RuleDefinition> {
    vec![
        RuleDefinition::new(
            "amount_zscore_gt_5",
            "Amount more than 5 standard deviations above the account mean",
            40.0,
            feature_above("amount_zscore", 5.0),
        ),
        RuleDefinition::new(
            "high_amount",
            "Amount above 1000 on an account with established history",
            25.0,
            Predicate::All {
                predicates: vec![
                    Predicate::AmountAbove { amount: 1000.0 },
                    Predicate::Not {
                        predicate: Box::new(Predicate::HistoryBelow { count: 3 }),
                    },
                ],
            },
        ),
        RuleDefinition::new(
            "new_geo",
            "Transaction from a location not previously seen on the account",
            20.0,
            flag("new_geo"),
        ),
        RuleDefinition::new(
            "new_device",
            "Transaction from a device not previously associated with the account",
            15.0,
            flag("new_device"),
        ),
        RuleDefinition::new(
            "rapid_succession",
            "Three or more prior transactions within the long velocity window",
            20.0,
            Predicate::FeatureAtLeast {
                feature: "velocity_long".into(),
                threshold: 3.0,
            },
        ),
        RuleDefinition::new(
            "high_risk_merchant_category",
            "Merchant category known for high fraud rates",
            15.0,
            Predicate::MerchantCategoryIn {
                categories: ["gambling", "crypto", "money_transfer", "jewelry"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            },
        ),
        RuleDefinition::new(
            "multiple_geos",
            "Transactions from more than one location within the geo window",
            25.0,
            Predicate::FeatureAtLeast {
                feature: "geo_count_window".into(),
                threshold: 2.0,
            },
        ),
        RuleDefinition::new(
            "unusual_merchant_category",
            "Merchant category not previously used by the account",
            15.0,
            flag("new_merchant_category"),
        ),
    ]
}

fn feature_above(feature: &str, threshold: f64) -> Predicate {
    Predicate::FeatureAbove {
        feature: feature.into(),
        threshold,
    }
}

fn flag(feature: &str) -> Predicate {
    Predicate::Flag {
        feature: feature.into(),
    }
}
