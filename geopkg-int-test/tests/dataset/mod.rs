mod dataset_test;
