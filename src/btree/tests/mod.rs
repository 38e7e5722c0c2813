mod tests_insert;
mod tests_node_persistence;
