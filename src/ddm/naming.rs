//! Dataset and storage-token naming conventions.

/// Prefix of detector-conditions datasets.
const CONDITIONS_PREFIX: &str = "ddo.";

/// Prefix of storage tokens naming a distributed destination.
const DISTRIBUTED_PREFIX: &str = "dst:";

/// Detector-conditions (database release) dataset.
pub fn is_conditions_dataset(name: &str) -> bool {
    name.starts_with(CONDITIONS_PREFIX)
}

/// Data type field of a dataset name, e.g. `AOD` in
/// `mc16_13TeV.410470.PhPy8EG.merge.AOD.e6337_s3126`.
pub fn dataset_type(name: &str) -> Option<&str> {
    name.split('.').nth(4).filter(|t| !t.is_empty())
}

pub fn is_distributed_token(token: &str) -> bool {
    token.starts_with(DISTRIBUTED_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditions_datasets() {
        assert!(is_conditions_dataset("ddo.000001.Atlas.Ideal.DBRelease.v220701"));
        assert!(!is_conditions_dataset("mc16_13TeV.410470.PhPy8EG.merge.AOD.e6337"));
    }

    #[test]
    fn type_is_fifth_field() {
        assert_eq!(
            dataset_type("mc16_13TeV.410470.PhPy8EG.merge.AOD.e6337_s3126"),
            Some("AOD")
        );
        assert_eq!(dataset_type("user.jdoe.test"), None);
        assert_eq!(dataset_type("a.b.c.d..f"), None);
    }

    #[test]
    fn distributed_tokens() {
        assert!(is_distributed_token("dst:CERN-PROD_DATADISK"));
        assert!(!is_distributed_token("ATLASDATADISK"));
        assert!(!is_distributed_token("CERN-PROD_DATADISK:dst"));
    }
}
