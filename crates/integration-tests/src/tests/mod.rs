mod partial_pull;
