use approx::assert_abs_diff_eq;
use blood_atlas::integrate::{common_genes, merge_annotations, merge_columns, RawExpressionTable};
use blood_atlas::io::{
    load_datasets, read_annotations, read_expression, read_probe_mapping, write_annotations,
    write_expression,
};
use blood_atlas::simulate::{simulate_atlas, SimulationConfig};
use blood_atlas::SampleSelector;
use std::fs;
use tempfile::TempDir;

#[test]
fn simulated_atlas_survives_a_trip_through_disk() {
    let sim = simulate_atlas(&SimulationConfig {
        n_platforms: 2,
        samples_per_platform: 5,
        n_platform_genes: 4,
        n_biological_genes: 6,
        ..Default::default()
    })
    .unwrap();
    let dir = TempDir::new().unwrap();
    let expr_path = dir.path().join("atlas.expression.tsv");
    let ann_path = dir.path().join("atlas.samples.tsv");
    write_expression(&expr_path, &sim.expression).unwrap();
    write_annotations(&ann_path, &sim.annotations).unwrap();

    let expression = read_expression(&expr_path).unwrap();
    assert_eq!(expression.gene_ids(), sim.expression.gene_ids());
    assert_eq!(expression.sample_ids(), sim.expression.sample_ids());
    for (a, b) in expression.values().iter().zip(sim.expression.values().iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
    }

    let annotations = read_annotations(&ann_path).unwrap();
    assert_eq!(annotations.len(), 10);
    annotations.validate_covers(&expression).unwrap();
    let first = annotations.get("P1_S1").unwrap();
    assert_eq!(first.platform, "Platform1");
    assert_eq!(first.dataset.as_deref(), Some("Platform1"));
    assert_eq!(first.extra.get("Group").map(String::as_str), Some("group1"));
    assert_eq!(annotations.datasets_in_order(), vec!["Platform1", "Platform2"]);
}

#[test]
fn probe_level_datasets_integrate_on_shared_genes() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("GSE1_expression.gct"),
        "#1.2\n3\t2\nName\tDescription\tA1\tA2\n\
         p1\tx\t1\t2\np2\tx\t3\t5\np3\tx\t9\t9\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("GSE2.tsv"),
        "probe\tB1\tA2\np1\t4\t0\np3\t6\t0\np4\t7\t0\n",
    )
    .unwrap();
    let map_path = dir.path().join("probes.tsv");
    fs::write(&map_path, "probe\tgene\np1\tGENE1\np2\tGENE1\np3\tGENE3\n").unwrap();

    let mapping = read_probe_mapping(&map_path).unwrap();
    let ids = vec!["GSE1".to_string(), "GSE2".to_string(), "GSE9".to_string()];
    let tables = load_datasets(dir.path(), &ids, Some(&mapping)).unwrap();
    assert_eq!(tables.len(), 2);

    let ordered: Vec<&RawExpressionTable> = ids.iter().filter_map(|id| tables.get(id)).collect();
    let genes = common_genes(&ordered);
    assert_eq!(genes, vec!["GENE1", "GENE3"]);

    let merged = merge_columns(&ordered, &genes).unwrap();
    // A2 appears in both datasets; the first one wins
    assert_eq!(merged.sample_ids(), &["A1", "A2", "B1"]);
    let v = merged.values();
    assert_abs_diff_eq!(v[[0, 0]], 2.0);
    assert_abs_diff_eq!(v[[0, 1]], 3.5);
    assert_abs_diff_eq!(v[[1, 1]], 9.0);
    assert_abs_diff_eq!(v[[0, 2]], 4.0);
    assert_abs_diff_eq!(v[[1, 2]], 6.0);

    let out = dir.path().join("merged.tsv");
    write_expression(&out, &merged).unwrap();
    assert_eq!(read_expression(&out).unwrap(), merged);
}

#[test]
fn annotation_tables_merge_first_record_wins() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a.tsv");
    let b = dir.path().join("b.tsv");
    fs::write(&a, "sample\tPlatform_Category\tDataset\nA1\tAffymetrix\tGSE1\n").unwrap();
    fs::write(
        &b,
        "sample\tPlatform_Category\tDataset\nA1\tRNAseq\tGSE2\nB1\tRNAseq\tGSE2\n",
    )
    .unwrap();
    let a = read_annotations(&a).unwrap();
    let b = read_annotations(&b).unwrap();
    let merged = merge_annotations(&[&a, &b]).unwrap();
    assert_eq!(merged.sample_ids(), vec!["A1", "B1"]);
    assert_eq!(merged.get("A1").unwrap().platform, "Affymetrix");
}

#[test]
fn blood_samples_are_selected_from_annotation_files() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("meta.tsv");
    fs::write(
        &path,
        "sample\tPlatform_Category\tDataset\tcelltype\ttissue\n\
         A1\tAffymetrix\tGSE1\tCD14+ monocyte\tblood\n\
         A2\tAffymetrix\tGSE1\tkeratinocyte\tskin\n\
         B1\tRNAseq\tGSE2\tNK cell\tblood\n",
    )
    .unwrap();
    let annotations = read_annotations(&path).unwrap();
    let selector = SampleSelector::blood_cells().unwrap().with_columns(vec!["celltype".into()]);
    assert_eq!(selector.select(&annotations).unwrap().sample_ids(), vec!["A1", "B1"]);
    assert_eq!(selector.match_report(&annotations)["NK"].len(), 1);
}
