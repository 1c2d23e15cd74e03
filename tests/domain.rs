use std::str::FromStr;

use assert_matches::assert_matches;

use shanoir_bids::domain::{
    FileType, PrefixSubstitution, SearchQuery, SequenceSpec, SortOrder, SubjectId,
};
use shanoir_bids::error::BidsError;

fn substitution(from: &str, to: &str) -> PrefixSubstitution {
    PrefixSubstitution {
        from: from.to_string(),
        to: to.to_string(),
    }
}

#[test]
fn subject_id_from_catalog_name() {
    let subs = vec![substitution("LONGIDEP", "lgp")];
    assert_eq!(
        SubjectId::derive("LONGIDEP 146 CV", &subs).as_str(),
        "lgp_146_CV"
    );
    assert_eq!(SubjectId::derive("OTHER 1", &subs).as_str(), "OTHER_1");
}

#[test]
fn substitutions_apply_in_order() {
    let subs = vec![substitution("LONGIDEP", "lgp"), substitution("lgp_", "sub-")];
    assert_eq!(SubjectId::derive("LONGIDEP 7 AB", &subs).as_str(), "sub-7_AB");
}

#[test]
fn archive_stem_with_and_without_label() {
    let subject = SubjectId::derive("sub-1", &[]);
    let plain = SequenceSpec {
        dataset_name: "T1 MPRAGE".to_string(),
        modality_dir: "anat".to_string(),
        label: String::new(),
    };
    assert_eq!(plain.archive_stem(&subject), "sub-1");

    let labelled = SequenceSpec {
        label: "t1w".to_string(),
        ..plain
    };
    assert_eq!(labelled.archive_stem(&subject), "sub-1_t1w");
}

#[test]
fn search_text_with_dataset_name() {
    let query = SearchQuery {
        study: "LONGIDEP".to_string(),
        subject_pattern: "longidep*037*mp".to_string(),
        dataset_name: Some("DWI SENSE".to_string()),
        page_size: 200,
        sort: SortOrder::default(),
        file_type: FileType::Dicom,
    };
    assert_eq!(
        query.search_text(),
        "studyName:LONGIDEP AND datasetName:\"DWI SENSE\" AND subjectName:longidep*037*mp"
    );

    let overview = SearchQuery {
        dataset_name: None,
        ..query
    };
    assert_eq!(
        overview.search_text(),
        "studyName:LONGIDEP AND subjectName:longidep*037*mp"
    );
}

#[test]
fn file_type_parsing() {
    assert_eq!(FileType::from_str("NIfTI").unwrap(), FileType::Nifti);
    assert_eq!(FileType::from_str("dcm").unwrap(), FileType::Dicom);
    assert_eq!(FileType::Nifti.download_format(), "nii");
    assert_matches!(
        FileType::from_str("analyze"),
        Err(BidsError::InvalidFileType(_))
    );
}

#[test]
fn sort_order_rejects_unknown_direction() {
    assert_matches!(
        "id,UP".parse::<SortOrder>(),
        Err(BidsError::InvalidSort(_))
    );
    let sort: SortOrder = "subjectName, desc".parse().unwrap();
    assert_eq!(sort.to_string(), "subjectName,DESC");
}
