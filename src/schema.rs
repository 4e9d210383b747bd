diesel::table! {
    entries (id) {
        id -> Int4,
        #[max_length = 50]
        source -> Nullable<Varchar>,
        #[max_length = 100]
        accession -> Nullable<Varchar>,
        s3_genome_path -> Nullable<Text>,
        s3_protein_path -> Nullable<Text>,
        #[max_length = 64]
        sequence_hash -> Nullable<Varchar>,
        total_bp -> Nullable<Int8>,
        species -> Nullable<Text>,
        kingdom -> Nullable<Text>,
        origin -> Nullable<Text>,
        #[max_length = 50]
        status -> Nullable<Varchar>,
        created_at -> Nullable<Timestamp>,
    }
}

diesel::table! {
    filtering_stats (id) {
        id -> Int4,
        #[max_length = 50]
        source -> Nullable<Varchar>,
        #[max_length = 100]
        accession -> Nullable<Varchar>,
        total_contigs -> Nullable<Int4>,
        contigs_kept -> Nullable<Int4>,
        contigs_removed -> Nullable<Int4>,
        created_at -> Nullable<Timestamp>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(entries, filtering_stats);
