use crate::cmr::{GranuleRecord, RelatedUrl};

pub const GET_DATA: &str = "GET DATA";
pub const EXTENDED_METADATA: &str = "EXTENDED METADATA";
pub const OPENDAP_DATA: &str = "OPENDAP DATA";

/// Primary data file: `GET DATA` that is not an OPeNDAP endpoint.
pub fn is_data_link(link: &RelatedUrl) -> bool {
    link.kind == GET_DATA && link.subtype.as_deref() != Some(OPENDAP_DATA)
}

pub fn is_metadata_link(link: &RelatedUrl) -> bool {
    link.kind == EXTENDED_METADATA
}

/// Flattens granule records into download URLs.
///
/// Data links of every record come first, in record order, followed by the
/// extended-metadata links of every record. Duplicates are kept.
pub fn extract_download_urls(records: &[GranuleRecord]) -> Vec<String> {
    let data = records
        .iter()
        .flat_map(|record| record.umm.related_urls.iter())
        .filter(|link| is_data_link(link));
    let metadata = records
        .iter()
        .flat_map(|record| record.umm.related_urls.iter())
        .filter(|link| is_metadata_link(link));
    data.chain(metadata).map(|link| link.url.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmr::GranuleUmm;

    fn link(url: &str, kind: &str, subtype: Option<&str>) -> RelatedUrl {
        RelatedUrl {
            url: url.to_string(),
            kind: kind.to_string(),
            subtype: subtype.map(str::to_string),
        }
    }

    fn record(links: Vec<RelatedUrl>) -> GranuleRecord {
        GranuleRecord {
            umm: GranuleUmm {
                granule_ur: None,
                related_urls: links,
            },
            ..GranuleRecord::default()
        }
    }

    #[test]
    fn data_links_precede_metadata_links() {
        let records = vec![
            record(vec![
                link("https://x/a.nc.md5", EXTENDED_METADATA, None),
                link("https://x/a.nc", GET_DATA, None),
            ]),
            record(vec![
                link("https://x/b.nc", GET_DATA, Some("DIRECT DOWNLOAD")),
                link("https://x/b.xml", EXTENDED_METADATA, None),
            ]),
        ];
        assert_eq!(
            extract_download_urls(&records),
            vec![
                "https://x/a.nc",
                "https://x/b.nc",
                "https://x/a.nc.md5",
                "https://x/b.xml"
            ]
        );
    }

    #[test]
    fn opendap_and_other_types_are_skipped() {
        let records = vec![record(vec![
            link("https://opendap/a", GET_DATA, Some(OPENDAP_DATA)),
            link("https://x/browse.png", "GET RELATED VISUALIZATION", None),
            link("s3://bucket/a.nc", "GET DATA VIA DIRECT ACCESS", None),
        ])];
        assert!(extract_download_urls(&records).is_empty());
    }

    #[test]
    fn duplicates_survive_and_output_is_stable() {
        let records = vec![
            record(vec![link("https://x/a.nc", GET_DATA, None)]),
            record(vec![link("https://x/a.nc", GET_DATA, None)]),
        ];
        let first = extract_download_urls(&records);
        let second = extract_download_urls(&records);
        assert_eq!(first, vec!["https://x/a.nc", "https://x/a.nc"]);
        assert_eq!(first, second);
    }
}
